use piko_proto::EndpointIdError;
use piko_tunnel::TunnelError;
use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid endpoint id: {0}")]
    InvalidEndpoint(#[from] EndpointIdError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out")]
    ConnectTimeout,

    #[error("Registration rejected with status {0}")]
    Rejected(u16),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Target request failed: {0}")]
    TargetRequest(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

impl AgentError {
    /// Errors that reconnecting cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidUrl(_) | AgentError::InvalidEndpoint(_)
        )
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
