//! Message transport abstraction for tunnel connections
//!
//! A tunnel runs over any duplex transport that preserves message boundaries.
//! The tunnel splits the transport once: the read loop owns the
//! [`FrameSource`] and the frame writer owns the [`FrameSink`], so neither side
//! has to lock the other out.

pub mod memory;
pub mod websocket;

pub use memory::{MemorySink, MemorySource, MemoryTransport};
pub use websocket::{AxumWebSocketTransport, TungsteniteTransport};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a transport
#[async_trait]
pub trait FrameSink: Send {
    /// Send one message
    async fn send(&mut self, data: Bytes) -> TransportResult<()>;

    /// Close the transport for writing
    async fn close(&mut self) -> TransportResult<()>;
}

/// Receiving half of a transport
#[async_trait]
pub trait FrameSource: Send {
    /// Receive one message
    ///
    /// Returns `None` once the peer has closed the transport in an orderly way.
    async fn recv(&mut self) -> TransportResult<Option<Bytes>>;
}

/// A message transport that can be split into independent halves
pub trait Transport: Send + 'static {
    type Sink: FrameSink + 'static;
    type Source: FrameSource + 'static;

    fn split(self) -> (Self::Sink, Self::Source);
}
