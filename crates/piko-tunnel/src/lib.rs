//! Multiplexed tunnel connections
//!
//! A [`TunnelConnection`] runs over any [`piko_transport::Transport`] and
//! carries many concurrent [`TunnelStream`]s. The proxy side opens streams;
//! the agent side accepts them.

pub mod config;
pub mod connection;
pub mod error;
pub mod stream;

pub use config::TunnelConfig;
pub use connection::{ConnectionState, ConnectionStats, Role, TunnelConnection};
pub use error::{CloseReason, TunnelError, TunnelResult};
pub use stream::{StreamState, TunnelStream};

/// Text of a caught panic payload
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
