//! Proxy configuration

use std::time::Duration;

/// Reverse proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bound on a whole exchange, from selecting a tunnel to the last
    /// response byte
    pub request_timeout: Duration,

    /// How long to wait for a free stream slot on one tunnel
    pub open_timeout: Duration,

    /// Attempts on other tunnels when a request cannot be sent
    pub max_retries: usize,

    pub max_request_body: usize,

    pub max_response_body: usize,

    /// Request bodies are written in chunks of this size
    pub body_chunk_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(5),
            max_retries: 1,
            max_request_body: 32 * 1024 * 1024,
            max_response_body: 32 * 1024 * 1024,
            body_chunk_size: 64 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_request_body(mut self, bytes: usize) -> Self {
        self.max_request_body = bytes;
        self
    }

    pub fn with_max_response_body(mut self, bytes: usize) -> Self {
        self.max_response_body = bytes;
        self
    }

    pub fn with_body_chunk_size(mut self, bytes: usize) -> Self {
        self.body_chunk_size = bytes.max(1);
        self
    }
}
