//! WebSocket transports
//!
//! Each binary WebSocket message carries one tunnel frame. Ping and pong
//! control messages are answered by the WebSocket libraries themselves and are
//! skipped here; a text message is never valid on a tunnel.

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use crate::{FrameSink, FrameSource, Transport, TransportError, TransportResult};

/// Server side: a WebSocket upgraded by axum
pub struct AxumWebSocketTransport {
    socket: WebSocket,
}

impl AxumWebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for AxumWebSocketTransport {
    type Sink = AxumSink;
    type Source = AxumSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.socket.split();
        (AxumSink(sink), AxumSource(source))
    }
}

pub struct AxumSink(SplitSink<WebSocket, AxumMessage>);

pub struct AxumSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, data: Bytes) -> TransportResult<()> {
        self.0
            .send(AxumMessage::Binary(data))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            match self.0.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::WebSocketError(e.to_string())),
                Some(Ok(AxumMessage::Binary(data))) => return Ok(Some(data)),
                Some(Ok(AxumMessage::Close(_))) => return Ok(None),
                Some(Ok(AxumMessage::Ping(_))) | Some(Ok(AxumMessage::Pong(_))) => {
                    trace!("Skipping WebSocket control message");
                }
                Some(Ok(AxumMessage::Text(_))) => {
                    return Err(TransportError::ProtocolError(
                        "unexpected text message".to_string(),
                    ))
                }
            }
        }
    }
}

/// Client side: a WebSocket dialed with tokio-tungstenite
pub struct TungsteniteTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> TungsteniteTransport<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

impl<S> Transport for TungsteniteTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = TungsteniteSink<S>;
    type Source = TungsteniteSource<S>;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.stream.split();
        (TungsteniteSink(sink), TungsteniteSource(source))
    }
}

pub struct TungsteniteSink<S>(SplitSink<WebSocketStream<S>, TungsteniteMessage>);

pub struct TungsteniteSource<S>(SplitStream<WebSocketStream<S>>);

#[async_trait]
impl<S> FrameSink for TungsteniteSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, data: Bytes) -> TransportResult<()> {
        self.0
            .send(TungsteniteMessage::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}

#[async_trait]
impl<S> FrameSource for TungsteniteSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            match self.0.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::WebSocketError(e.to_string())),
                Some(Ok(TungsteniteMessage::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(TungsteniteMessage::Close(_))) => return Ok(None),
                Some(Ok(TungsteniteMessage::Text(_))) => {
                    return Err(TransportError::ProtocolError(
                        "unexpected text message".to_string(),
                    ))
                }
                Some(Ok(_)) => {
                    trace!("Skipping WebSocket control message");
                }
            }
        }
    }
}
