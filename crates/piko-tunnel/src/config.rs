//! Tunnel connection configuration

use std::time::Duration;

/// Tunnel-specific configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Send a ping after this long without inbound traffic
    pub keepalive_interval: Duration,

    /// The connection is dead after `keepalive_interval * keepalive_timeout_factor`
    /// without inbound traffic
    pub keepalive_timeout_factor: u32,

    /// Maximum number of streams open at once
    pub max_concurrent_streams: usize,

    /// Inbound frames buffered per stream before the read loop waits
    pub stream_buffer: usize,

    /// Outbound frames buffered before stream writers wait
    pub writer_buffer: usize,

    /// How long `drain` waits for in-flight streams before closing
    pub drain_grace: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout_factor: 3,
            max_concurrent_streams: 1024,
            stream_buffer: 64,
            writer_buffer: 256,
            drain_grace: Duration::from_secs(30),
        }
    }
}

impl TunnelConfig {
    /// Set custom keep-alive interval
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_keepalive_timeout_factor(mut self, factor: u32) -> Self {
        self.keepalive_timeout_factor = factor.max(1);
        self
    }

    pub fn with_max_concurrent_streams(mut self, max: usize) -> Self {
        self.max_concurrent_streams = max.max(1);
        self
    }

    pub fn with_stream_buffer(mut self, frames: usize) -> Self {
        self.stream_buffer = frames.max(1);
        self
    }

    pub fn with_writer_buffer(mut self, frames: usize) -> Self {
        self.writer_buffer = frames.max(1);
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Silence after which the peer is considered dead
    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_interval * self.keepalive_timeout_factor
    }
}
