//! Tunnel errors

use piko_proto::ResetReason;
use std::fmt;
use thiserror::Error;

/// Errors returned by tunnel connections and their streams
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// The stream id space of the connection is exhausted
    #[error("No stream capacity left on connection")]
    NoCapacity,

    /// The connection is draining or closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// No stream slot became free in time
    #[error("Timed out waiting for a stream slot")]
    Timeout,

    #[error("Stream reset: {0}")]
    StreamReset(ResetReason),

    /// Write after the local side half-closed the stream
    #[error("Stream closed for writing")]
    StreamClosed,
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Why a connection moved to `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Local,
    /// Drain completed or its grace period elapsed
    Drained,
    TransportError,
    ProtocolViolation,
    KeepaliveTimeout,
    /// The peer closed the transport
    PeerClosed,
    /// A connection task panicked
    Panicked,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Local => "local",
            CloseReason::Drained => "drained",
            CloseReason::TransportError => "transport_error",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::KeepaliveTimeout => "keepalive_timeout",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Panicked => "panicked",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
