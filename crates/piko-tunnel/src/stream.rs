//! Streams multiplexed over a tunnel connection
//!
//! Each direction of a stream closes independently: `half_close` ends the
//! local direction, and `recv` returns `None` once the peer has ended its
//! own. A stream dropped before both directions finished is reset with
//! `Cancelled` so the peer does not wait on it.

use bytes::Bytes;
use piko_proto::{Frame, ResetReason, StreamId, MAX_FRAME_SIZE};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::trace;

use crate::connection::{ResetCell, TunnelConnection};
use crate::error::{TunnelError, TunnelResult};

/// What the reader task delivers to a stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    HalfClose,
    Reset(ResetReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// One direction has finished
    HalfClosed,
    Closed,
    Reset,
}

/// A bidirectional byte stream inside a tunnel connection
pub struct TunnelStream {
    id: StreamId,
    conn: Arc<TunnelConnection>,
    rx: mpsc::Receiver<StreamEvent>,
    /// Set by the reader when the peer resets the stream
    reset: ResetCell,
    metadata: Bytes,
    local_closed: bool,
    remote_closed: bool,
    /// Set once the stream failed; repeated by later calls
    failure: Option<TunnelError>,
    bytes_sent: u64,
    bytes_received: u64,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.id)
            .field("conn_id", &self.conn.id())
            .field("state", &self.state())
            .finish()
    }
}

impl TunnelStream {
    pub(crate) fn new(
        id: StreamId,
        conn: Arc<TunnelConnection>,
        rx: mpsc::Receiver<StreamEvent>,
        reset: ResetCell,
        permit: OwnedSemaphorePermit,
        metadata: Bytes,
    ) -> Self {
        Self {
            id,
            conn,
            rx,
            reset,
            metadata,
            local_closed: false,
            remote_closed: false,
            failure: None,
            bytes_sent: 0,
            bytes_received: 0,
            _permit: permit,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Metadata carried by the peer's OpenStream frame (the endpoint id);
    /// empty for locally opened streams
    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn connection(&self) -> &Arc<TunnelConnection> {
        &self.conn
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn state(&self) -> StreamState {
        if self.failure.is_some() {
            return StreamState::Reset;
        }
        match (self.local_closed, self.remote_closed) {
            (false, false) => StreamState::Open,
            (true, true) => StreamState::Closed,
            _ => StreamState::HalfClosed,
        }
    }

    /// Send bytes to the peer
    ///
    /// Payloads larger than one frame are split.
    pub async fn send(&mut self, mut data: Bytes) -> TunnelResult<()> {
        self.check_reset()?;
        if self.local_closed {
            return Err(TunnelError::StreamClosed);
        }

        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_FRAME_SIZE));
            let len = chunk.len() as u64;
            self.conn.send_frame(Frame::data(self.id, chunk)).await?;
            self.bytes_sent += len;
        }
        Ok(())
    }

    /// Finish the local direction; the peer's `recv` returns `None` after
    /// draining what was sent
    pub async fn half_close(&mut self) -> TunnelResult<()> {
        self.check_reset()?;
        if self.local_closed {
            return Ok(());
        }

        self.conn.send_frame(Frame::half_close(self.id)).await?;
        self.local_closed = true;
        self.finish_if_done();
        Ok(())
    }

    /// Next chunk from the peer, or `None` after the peer half-closed
    pub async fn recv(&mut self) -> TunnelResult<Option<Bytes>> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if self.remote_closed {
            // Nothing more is queued; only a reset can still arrive
            self.check_reset()?;
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(StreamEvent::Data(data)) => {
                self.bytes_received += data.len() as u64;
                Ok(Some(data))
            }
            Some(StreamEvent::HalfClose) => {
                self.remote_closed = true;
                self.finish_if_done();
                Ok(None)
            }
            Some(StreamEvent::Reset(reason)) => {
                trace!("Stream {} reset by peer: {}", self.id, reason);
                Err(self.fail(TunnelError::StreamReset(reason)))
            }
            None => {
                let error = match self.reset.get() {
                    Some(reason) => TunnelError::StreamReset(*reason),
                    None => TunnelError::ConnectionClosed,
                };
                Err(self.fail(error))
            }
        }
    }

    /// Abort the stream in both directions
    pub async fn reset(&mut self, reason: ResetReason) {
        if self.failure.is_some() || self.state() == StreamState::Closed {
            return;
        }
        let _ = self.conn.send_frame(Frame::reset(self.id, reason)).await;
        self.fail(TunnelError::StreamReset(reason));
    }

    /// Fail with an earlier failure or a reset the peer already sent
    fn check_reset(&mut self) -> TunnelResult<()> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        match self.reset.get() {
            Some(reason) => Err(self.fail(TunnelError::StreamReset(*reason))),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: TunnelError) -> TunnelError {
        self.failure = Some(error.clone());
        self.conn.remove_stream(self.id);
        error
    }

    fn finish_if_done(&mut self) {
        if self.local_closed && self.remote_closed {
            trace!("Stream {} closed", self.id);
            self.conn.remove_stream(self.id);
        }
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if self.failure.is_none() && !(self.local_closed && self.remote_closed) {
            trace!("Stream {} dropped before finishing, resetting", self.id);
            self.conn.send_reset_nowait(self.id, ResetReason::Cancelled);
        }
        self.conn.remove_stream(self.id);
    }
}
