//! Agent configuration

use piko_proto::UPSTREAM_PATH;
use piko_tunnel::TunnelConfig;
use std::time::Duration;
use url::Url;

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the server's upstream listener, e.g. `ws://localhost:8001`
    ///
    /// `http` and `https` are accepted and mapped to `ws` and `wss`.
    pub server_url: String,

    /// Endpoint this agent serves
    pub endpoint_id: String,

    /// Local HTTP service requests are forwarded to (host:port)
    pub target_addr: String,

    pub tunnel: TunnelConfig,

    /// Deadline for the WebSocket handshake
    pub connect_timeout: Duration,

    /// Deadline for one request to the target, response body included
    pub target_timeout: Duration,

    /// First reconnect delay; doubles on each failure up to `reconnect_max`
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl AgentConfig {
    pub fn new(
        server_url: impl Into<String>,
        endpoint_id: impl Into<String>,
        target_addr: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            endpoint_id: endpoint_id.into(),
            target_addr: target_addr.into(),
            tunnel: TunnelConfig::default(),
            connect_timeout: Duration::from_secs(10),
            target_timeout: Duration::from_secs(30),
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }

    pub fn with_tunnel_config(mut self, tunnel: TunnelConfig) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_target_timeout(mut self, timeout: Duration) -> Self {
        self.target_timeout = timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min = min;
        self.reconnect_max = max.max(min);
        self
    }

    /// WebSocket URL of the upstream registration route
    pub fn upstream_url(&self) -> AgentResult<Url> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| AgentError::InvalidUrl(format!("{}: {}", self.server_url, e)))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(AgentError::InvalidUrl(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| AgentError::InvalidUrl(self.server_url.clone()))?;

        let path = format!("{}{}", url.path().trim_end_matches('/'), UPSTREAM_PATH);
        url.set_path(&path);
        Ok(url)
    }
}
