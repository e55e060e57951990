//! Upstream acceptor
//!
//! Upstreams open a WebSocket to [`piko_proto::UPSTREAM_PATH`] and name the
//! endpoint they serve. Each upgraded socket becomes a server-role
//! [`piko_tunnel::TunnelConnection`] that stays in the registry until it
//! closes.

pub mod error;
pub mod metrics;
pub mod server;

pub use error::{UpstreamError, UpstreamResult};
pub use metrics::{NoopUpstreamMetrics, PrometheusUpstreamMetrics, UpstreamMetrics};
pub use server::UpstreamServer;
