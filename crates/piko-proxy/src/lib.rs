//! Reverse proxy over tunnels
//!
//! [`ReverseProxy`] forwards one buffered HTTP request to an upstream through
//! the tunnel registry. [`ProxyServer`] puts it behind an axum listener.

pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod server;

pub use config::ProxyConfig;
pub use error::{ErrorResponse, ProxyError};
pub use metrics::{NoopProxyMetrics, PrometheusProxyMetrics, ProxyMetrics};
pub use proxy::{strip_hop_by_hop, ReverseProxy};
pub use server::ProxyServer;
