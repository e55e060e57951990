//! In-process transport
//!
//! Two connected ends backed by bounded channels. Used by tests, and by
//! anything that wants to run a tunnel without a socket.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{FrameSink, FrameSource, Transport, TransportError, TransportResult};

/// One end of an in-memory transport pair
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl MemoryTransport {
    /// Create two connected ends, each buffering up to `capacity` messages
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }

    /// Send on this end without splitting it
    pub async fn send(&mut self, data: Bytes) -> TransportResult<()> {
        self.tx
            .send(data)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive on this end without splitting it
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Transport for MemoryTransport {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn split(self) -> (Self::Sink, Self::Source) {
        (MemorySink { tx: Some(self.tx) }, MemorySource { rx: self.rx })
    }
}

#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, data: Bytes) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(data)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        // Dropping the sender ends the peer's source
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_connected_both_ways() {
        let (a, b) = MemoryTransport::pair(4);
        let (mut a_sink, mut a_source) = a.split();
        let (mut b_sink, mut b_source) = b.split();

        a_sink.send(Bytes::from("ping")).await.unwrap();
        assert_eq!(b_source.recv().await.unwrap(), Some(Bytes::from("ping")));

        b_sink.send(Bytes::from("pong")).await.unwrap();
        assert_eq!(a_source.recv().await.unwrap(), Some(Bytes::from("pong")));
    }

    #[tokio::test]
    async fn test_close_ends_peer_source() {
        let (a, b) = MemoryTransport::pair(4);
        let (mut a_sink, _a_source) = a.split();
        let (_b_sink, mut b_source) = b.split();

        a_sink.close().await.unwrap();
        assert_eq!(b_source.recv().await.unwrap(), None);
        assert!(matches!(
            a_sink.send(Bytes::from("late")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_fails() {
        let (mut a, b) = MemoryTransport::pair(4);
        drop(b);
        assert!(a.send(Bytes::from("x")).await.is_err());
    }
}
