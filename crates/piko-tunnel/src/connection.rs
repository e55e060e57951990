//! Multiplexed tunnel connection
//!
//! One transport carries many concurrent streams. A writer task owns the
//! transport sink and drains a bounded frame queue, plus an unbounded control
//! queue that goes first. A reader task decodes inbound frames and routes them
//! to per-stream queues; its own replies (pongs and resets) only ever go to the
//! control queue, so the reader never waits on the writer. A keepalive task
//! pings an idle peer and closes the connection once it stays silent for too
//! long.

use bytes::Bytes;
use futures::FutureExt;
use piko_proto::{Frame, ResetReason, StreamId};
use piko_transport::{FrameSink, FrameSource, Transport, TransportError};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::TunnelConfig;
use crate::error::{CloseReason, TunnelError, TunnelResult};
use crate::stream::{StreamEvent, TunnelStream};

/// Peer-opened streams waiting for `accept_stream`
const ACCEPT_BACKLOG: usize = 64;

/// Upper bound on flushing queued frames after shutdown
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Which end of the tunnel this connection is
///
/// The server opens odd stream ids and the agent opens even ones, so both
/// sides can open streams without coordinating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Agent,
}

impl Role {
    fn first_stream_id(&self) -> u64 {
        match self {
            Role::Server => 1,
            Role::Agent => 2,
        }
    }

    fn is_peer_stream_id(&self, stream_id: StreamId) -> bool {
        match self {
            Role::Server => stream_id % 2 == 0,
            Role::Agent => stream_id % 2 == 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    /// No new streams; closes once in-flight streams finish
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub active_streams: usize,
    pub uptime_secs: u64,
}

/// Reset reason shared by a stream and its slot; outlives a full queue
pub(crate) type ResetCell = Arc<OnceLock<ResetReason>>;

struct StreamSlot {
    tx: mpsc::Sender<StreamEvent>,
    reset: ResetCell,
    /// Peer sent HalfClose
    remote_closed: bool,
}

impl StreamSlot {
    /// Record a reset; the stream reports it even if the event cannot be queued
    fn reset(self, reason: ResetReason) {
        let _ = self.reset.set(reason);
        let _ = self.tx.try_send(StreamEvent::Reset(reason));
    }
}

struct PendingStream {
    stream_id: StreamId,
    metadata: Bytes,
    rx: mpsc::Receiver<StreamEvent>,
    reset: ResetCell,
    permit: OwnedSemaphorePermit,
}

enum DataRoute {
    Deliver(mpsc::Sender<StreamEvent>),
    AfterHalfClose(StreamSlot),
    Unknown,
}

/// A live tunnel to one upstream, carrying many streams
pub struct TunnelConnection {
    id: String,
    endpoint_id: String,
    role: Role,
    config: TunnelConfig,
    created_at: Instant,
    state: Mutex<ConnectionState>,
    close_reason: OnceLock<CloseReason>,
    /// Lock order is `state` then `streams`; neither is held across an await
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    /// Held while an id is allocated and its OpenStream queued, so ids reach
    /// the peer in increasing order
    next_stream_id: Mutex<u64>,
    highest_peer_stream_id: AtomicU64,
    slots: Arc<Semaphore>,
    frame_tx: mpsc::Sender<Frame>,
    control_tx: mpsc::UnboundedSender<Frame>,
    accept_rx: AsyncMutex<mpsc::Receiver<PendingStream>>,
    /// Milliseconds since `created_at` of the last inbound message
    last_activity_ms: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    shutdown: CancellationToken,
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("endpoint_id", &self.endpoint_id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl TunnelConnection {
    /// Start multiplexing over an established transport
    ///
    /// Spawns the reader, writer and keepalive tasks and returns the
    /// connection in the `Active` state.
    pub fn spawn<T: Transport>(
        transport: T,
        endpoint_id: impl Into<String>,
        role: Role,
        config: TunnelConfig,
    ) -> Arc<Self> {
        let (sink, source) = transport.split();

        let (frame_tx, frame_rx) = mpsc::channel(config.writer_buffer.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let conn = Arc::new(Self {
            id: format!("conn-{}", uuid::Uuid::new_v4()),
            endpoint_id: endpoint_id.into(),
            role,
            created_at: Instant::now(),
            state: Mutex::new(ConnectionState::Connecting),
            close_reason: OnceLock::new(),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: Mutex::new(role.first_stream_id()),
            highest_peer_stream_id: AtomicU64::new(0),
            slots: Arc::new(Semaphore::new(config.max_concurrent_streams.max(1))),
            frame_tx,
            control_tx,
            accept_rx: AsyncMutex::new(accept_rx),
            last_activity_ms: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            config,
        });

        *lock(&conn.state) = ConnectionState::Active;

        tokio::spawn(guarded(
            conn.clone(),
            "writer",
            conn.clone().writer_task(sink, frame_rx, control_rx),
        ));
        tokio::spawn(guarded(
            conn.clone(),
            "reader",
            conn.clone().reader_task(source, accept_tx),
        ));
        tokio::spawn(guarded(
            conn.clone(),
            "keepalive",
            conn.clone().keepalive_task(),
        ));

        info!(
            conn_id = %conn.id,
            endpoint_id = %conn.endpoint_id,
            role = ?role,
            "Tunnel connection established"
        );

        conn
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Why the connection closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Number of streams currently registered on the connection
    pub fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// When the peer last sent anything
    pub fn last_activity(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            active_streams: self.stream_count(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Open a new stream towards the peer
    ///
    /// Waits up to `timeout` for a free stream slot when the connection is at
    /// its concurrency limit.
    pub async fn open_stream(self: &Arc<Self>, timeout: Duration) -> TunnelResult<TunnelStream> {
        if !self.is_active() {
            return Err(TunnelError::ConnectionClosed);
        }
        let deadline = Instant::now() + timeout;

        let permit = match tokio::time::timeout_at(deadline, self.slots.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(TunnelError::ConnectionClosed),
            Err(_) => {
                debug!(conn_id = %self.id, "Timed out waiting for a stream slot");
                return Err(TunnelError::Timeout);
            }
        };

        let queued = tokio::select! {
            reserved = tokio::time::timeout_at(deadline, self.frame_tx.reserve()) => reserved,
            _ = self.shutdown.cancelled() => return Err(TunnelError::ConnectionClosed),
        };
        let frame_permit = match queued {
            Ok(Ok(frame_permit)) => frame_permit,
            Ok(Err(_)) => return Err(TunnelError::ConnectionClosed),
            Err(_) => {
                debug!(conn_id = %self.id, "Timed out waiting for the writer");
                return Err(TunnelError::Timeout);
            }
        };

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let reset = ResetCell::default();
        let stream_id = {
            let mut next = lock(&self.next_stream_id);
            let stream_id = self.allocate_stream_id(&mut next)?;
            if !self.insert_stream(stream_id, tx, reset.clone()) {
                return Err(TunnelError::ConnectionClosed);
            }
            let metadata = Bytes::from(self.endpoint_id.clone());
            frame_permit.send(Frame::open(stream_id, metadata));
            stream_id
        };

        debug!("[{}] Opened stream {}", self.id, stream_id);
        Ok(TunnelStream::new(
            stream_id,
            self.clone(),
            rx,
            reset,
            permit,
            Bytes::new(),
        ))
    }

    /// Wait for the next stream opened by the peer
    ///
    /// Returns `None` once the connection is closed.
    pub async fn accept_stream(self: &Arc<Self>) -> Option<TunnelStream> {
        let pending = {
            let mut accept_rx = self.accept_rx.lock().await;
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                pending = accept_rx.recv() => pending,
            }
        }?;

        debug!("[{}] Accepted stream {}", self.id, pending.stream_id);
        Some(TunnelStream::new(
            pending.stream_id,
            self.clone(),
            pending.rx,
            pending.reset,
            pending.permit,
            pending.metadata,
        ))
    }

    /// Close the connection now; in-flight streams fail with `ConnectionClosed`
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    /// Stop accepting new streams and close once in-flight ones finish
    ///
    /// Closes anyway after `grace`.
    pub fn drain(self: &Arc<Self>, grace: Duration) {
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Active {
                return;
            }
            *state = ConnectionState::Draining;
        }

        let in_flight = self.stream_count();
        info!(conn_id = %self.id, in_flight, "Draining tunnel connection");

        if in_flight == 0 {
            self.close_with(CloseReason::Drained);
            return;
        }

        let conn = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    let remaining = conn.stream_count();
                    if conn.close_with(CloseReason::Drained) {
                        warn!(conn_id = %conn.id, remaining, "Drain grace elapsed, closing");
                    }
                }
                _ = conn.shutdown.cancelled() => {}
            }
        });
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Move to `Closed`; returns false if already closed
    pub(crate) fn close_with(&self, reason: CloseReason) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        let _ = self.close_reason.set(reason);

        self.slots.close();

        // Dropping the slots ends every stream's queue
        let streams: Vec<(StreamId, StreamSlot)> = lock(&self.streams).drain().collect();
        for (stream_id, _) in &streams {
            self.send_control(Frame::reset(*stream_id, ResetReason::ConnectionClosed));
        }
        let aborted = streams.len();
        drop(streams);

        self.shutdown.cancel();

        match reason {
            CloseReason::Local | CloseReason::Drained | CloseReason::PeerClosed => info!(
                conn_id = %self.id,
                endpoint_id = %self.endpoint_id,
                reason = %reason,
                aborted,
                "Tunnel connection closed"
            ),
            _ => warn!(
                conn_id = %self.id,
                endpoint_id = %self.endpoint_id,
                reason = %reason,
                aborted,
                "Tunnel connection closed"
            ),
        }
        true
    }

    /// Queue a frame for the writer, waiting for room
    pub(crate) async fn send_frame(&self, frame: Frame) -> TunnelResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(TunnelError::ConnectionClosed);
        }
        tokio::select! {
            sent = self.frame_tx.send(frame) => sent.map_err(|_| TunnelError::ConnectionClosed),
            _ = self.shutdown.cancelled() => Err(TunnelError::ConnectionClosed),
        }
    }

    /// Queue a frame ahead of stream traffic without waiting
    fn send_control(&self, frame: Frame) {
        if self.control_tx.send(frame).is_err() {
            trace!("[{}] Writer gone, dropping control frame", self.id);
        }
    }

    /// Queue a reset without waiting; used where no await is possible
    ///
    /// Goes through the stream queue so it never overtakes the stream's
    /// OpenStream.
    pub(crate) fn send_reset_nowait(&self, stream_id: StreamId, reason: ResetReason) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        match self.frame_tx.try_send(Frame::reset(stream_id, reason)) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let frame_tx = self.frame_tx.clone();
                    handle.spawn(async move {
                        let _ = frame_tx.send(frame).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Forget a stream; closes a draining connection once none remain
    pub(crate) fn remove_stream(&self, stream_id: StreamId) {
        let removed = lock(&self.streams).remove(&stream_id).is_some();
        if removed {
            trace!("[{}] Removed stream {}", self.id, stream_id);
            self.after_stream_removed();
        }
    }

    fn after_stream_removed(&self) {
        if self.state() == ConnectionState::Draining && self.stream_count() == 0 {
            self.close_with(CloseReason::Drained);
        }
    }

    fn allocate_stream_id(&self, next: &mut u64) -> TunnelResult<StreamId> {
        let stream_id = StreamId::try_from(*next).map_err(|_| {
            warn!(conn_id = %self.id, "Stream id space exhausted");
            TunnelError::NoCapacity
        })?;
        *next += 2;
        Ok(stream_id)
    }

    /// Register a stream if the connection still takes new ones
    fn insert_stream(
        &self,
        stream_id: StreamId,
        tx: mpsc::Sender<StreamEvent>,
        reset: ResetCell,
    ) -> bool {
        let state = lock(&self.state);
        if *state != ConnectionState::Active {
            return false;
        }
        lock(&self.streams).insert(
            stream_id,
            StreamSlot {
                tx,
                reset,
                remote_closed: false,
            },
        );
        true
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    async fn writer_task<S: FrameSink>(
        self: Arc<Self>,
        mut sink: S,
        mut rx: mpsc::Receiver<Frame>,
        mut control_rx: mpsc::UnboundedReceiver<Frame>,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(frame) = control_rx.recv() => frame,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if let Err(e) = self.write_frame(&mut sink, frame).await {
                warn!(conn_id = %self.id, error = %e, "Tunnel write failed");
                self.close_with(CloseReason::TransportError);
                return;
            }
        }

        // Resets and half-closes queued before shutdown still go out
        let flush = async {
            while let Ok(frame) = control_rx.try_recv() {
                if self.write_frame(&mut sink, frame).await.is_err() {
                    return;
                }
            }
            while let Ok(frame) = rx.try_recv() {
                if self.write_frame(&mut sink, frame).await.is_err() {
                    return;
                }
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
            debug!("[{}] Flush on shutdown timed out", self.id);
        }

        debug!("[{}] Writer task ended", self.id);
    }

    async fn write_frame<S: FrameSink>(
        &self,
        sink: &mut S,
        frame: Frame,
    ) -> Result<(), TransportError> {
        let data = match frame.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "Dropping unencodable frame");
                return Ok(());
            }
        };

        let len = data.len() as u64;
        sink.send(data).await?;

        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!(
            "[{}] Sent frame: stream={}, kind={:?}, len={}",
            self.id,
            frame.stream_id(),
            frame.kind(),
            len
        );
        Ok(())
    }

    async fn reader_task<S: FrameSource>(
        self: Arc<Self>,
        mut source: S,
        accept_tx: mpsc::Sender<PendingStream>,
    ) {
        let reason = loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                received = source.recv() => received,
            };

            let data = match received {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!("[{}] Peer closed the transport", self.id);
                    break CloseReason::PeerClosed;
                }
                Err(e) => {
                    warn!(conn_id = %self.id, error = %e, "Tunnel read failed");
                    break CloseReason::TransportError;
                }
            };

            self.touch();
            self.bytes_received
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            self.frames_received.fetch_add(1, Ordering::Relaxed);

            let frame = match Frame::decode(data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn_id = %self.id, error = %e, "Protocol violation from peer");
                    break CloseReason::ProtocolViolation;
                }
            };

            trace!(
                "[{}] Received frame: stream={}, kind={:?}",
                self.id,
                frame.stream_id(),
                frame.kind()
            );

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                _ = self.dispatch(frame, &accept_tx) => {}
            }
        };

        self.close_with(reason);
    }

    async fn dispatch(&self, frame: Frame, accept_tx: &mpsc::Sender<PendingStream>) {
        match frame {
            Frame::Ping { token } => self.send_control(Frame::Pong { token }),
            Frame::Pong { token } => {
                trace!("[{}] Pong {}", self.id, token);
            }
            Frame::OpenStream {
                stream_id,
                metadata,
            } => self.handle_open(stream_id, metadata, accept_tx).await,
            Frame::Data { stream_id, payload } => match self.route_data(stream_id) {
                DataRoute::Deliver(tx) => {
                    // Waiting here pushes back on the peer until the stream catches up
                    if tx.send(StreamEvent::Data(payload)).await.is_err() {
                        trace!("[{}] Stream {} receiver dropped", self.id, stream_id);
                    }
                }
                DataRoute::AfterHalfClose(slot) => {
                    warn!(conn_id = %self.id, stream_id, "Data after half-close");
                    slot.reset(ResetReason::ProtocolError);
                    self.send_control(Frame::reset(stream_id, ResetReason::ProtocolError));
                    self.after_stream_removed();
                }
                DataRoute::Unknown => self.reject_unknown(stream_id),
            },
            Frame::HalfClose { stream_id } => {
                let tx = lock(&self.streams).get_mut(&stream_id).map(|slot| {
                    slot.remote_closed = true;
                    slot.tx.clone()
                });
                match tx {
                    Some(tx) => {
                        let _ = tx.send(StreamEvent::HalfClose).await;
                    }
                    None => self.reject_unknown(stream_id),
                }
            }
            Frame::Reset {
                stream_id,
                reason,
                detail,
            } => {
                let slot = lock(&self.streams).remove(&stream_id);
                match slot {
                    Some(slot) => {
                        debug!(
                            "[{}] Stream {} reset by peer: {} {}",
                            self.id, stream_id, reason, detail
                        );
                        slot.reset(reason);
                        self.after_stream_removed();
                    }
                    None => trace!("[{}] Reset for unknown stream {}", self.id, stream_id),
                }
            }
        }
    }

    fn route_data(&self, stream_id: StreamId) -> DataRoute {
        let mut streams = lock(&self.streams);
        match streams.get(&stream_id) {
            None => DataRoute::Unknown,
            Some(slot) if slot.remote_closed => match streams.remove(&stream_id) {
                Some(slot) => DataRoute::AfterHalfClose(slot),
                None => DataRoute::Unknown,
            },
            Some(slot) => DataRoute::Deliver(slot.tx.clone()),
        }
    }

    async fn handle_open(
        &self,
        stream_id: StreamId,
        metadata: Bytes,
        accept_tx: &mpsc::Sender<PendingStream>,
    ) {
        let highest = self.highest_peer_stream_id.load(Ordering::SeqCst);
        if !self.role.is_peer_stream_id(stream_id) || u64::from(stream_id) <= highest {
            warn!(conn_id = %self.id, stream_id, "Refusing stream with invalid id");
            self.refuse(stream_id);
            return;
        }
        self.highest_peer_stream_id
            .store(u64::from(stream_id), Ordering::SeqCst);

        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("[{}] Refusing stream {}: at capacity", self.id, stream_id);
                self.refuse(stream_id);
                return;
            }
        };

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let reset = ResetCell::default();
        if !self.insert_stream(stream_id, tx, reset.clone()) {
            self.refuse(stream_id);
            return;
        }

        let pending = PendingStream {
            stream_id,
            metadata,
            rx,
            reset,
            permit,
        };
        if accept_tx.send(pending).await.is_err() {
            warn!(conn_id = %self.id, stream_id, "Accept channel closed, dropping stream");
            lock(&self.streams).remove(&stream_id);
            self.refuse(stream_id);
        }
    }

    fn refuse(&self, stream_id: StreamId) {
        self.send_control(Frame::reset(stream_id, ResetReason::Refused));
    }

    fn reject_unknown(&self, stream_id: StreamId) {
        debug!("[{}] Frame for unknown stream {}", self.id, stream_id);
        self.send_control(Frame::reset(stream_id, ResetReason::UnknownStream));
    }

    async fn keepalive_task(self: Arc<Self>) {
        let interval = self.config.keepalive_interval;
        if interval.is_zero() {
            return;
        }
        let timeout = self.config.keepalive_timeout();

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let idle = self.idle_for();
            if idle >= timeout {
                warn!(
                    conn_id = %self.id,
                    idle_ms = idle.as_millis() as u64,
                    "Peer stopped responding"
                );
                self.close_with(CloseReason::KeepaliveTimeout);
                return;
            }

            if idle >= interval {
                let token = self.created_at.elapsed().as_millis() as u64;
                self.send_control(Frame::Ping { token });
            }
        }
    }
}

/// Run a connection task, closing the connection if it panics
async fn guarded<F>(conn: Arc<TunnelConnection>, task: &'static str, fut: F)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        error!(
            conn_id = %conn.id,
            task,
            panic = %crate::panic_message(panic.as_ref()),
            "Tunnel task panicked"
        );
        conn.close_with(CloseReason::Panicked);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
