//! Multiplexing tests over in-memory transports

use bytes::Bytes;
use piko_proto::{Frame, ResetReason};
use piko_transport::MemoryTransport;
use piko_tunnel::{
    CloseReason, ConnectionState, Role, StreamState, TunnelConfig, TunnelConnection, TunnelError,
    TunnelStream,
};
use std::sync::Arc;
use std::time::Duration;

const OPEN_TIMEOUT: Duration = Duration::from_secs(1);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("piko_tunnel=debug")
        .with_test_writer()
        .try_init();
}

fn connected_pair(config: TunnelConfig) -> (Arc<TunnelConnection>, Arc<TunnelConnection>) {
    let (a, b) = MemoryTransport::pair(64);
    let server = TunnelConnection::spawn(a, "my-endpoint", Role::Server, config.clone());
    let agent = TunnelConnection::spawn(b, "my-endpoint", Role::Agent, config);
    (server, agent)
}

/// Server connection whose peer is driven by hand
fn raw_peer(config: TunnelConfig) -> (Arc<TunnelConnection>, MemoryTransport) {
    let (a, raw) = MemoryTransport::pair(64);
    let server = TunnelConnection::spawn(a, "my-endpoint", Role::Server, config);
    (server, raw)
}

async fn read_to_end(stream: &mut TunnelStream) -> Result<Vec<u8>, TunnelError> {
    let mut body = Vec::new();
    while let Some(chunk) = stream.recv().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn spawn_echo(agent: Arc<TunnelConnection>) {
    tokio::spawn(async move {
        while let Some(mut stream) = agent.accept_stream().await {
            tokio::spawn(async move {
                let body = read_to_end(&mut stream).await.unwrap();
                stream.send(Bytes::from(body)).await.unwrap();
                stream.half_close().await.unwrap();
            });
        }
    });
}

#[tokio::test]
async fn test_stream_round_trip() {
    init_tracing();
    let (server, agent) = connected_pair(TunnelConfig::default());

    let mut outbound = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    outbound.send(Bytes::from("hello")).await.unwrap();
    outbound.half_close().await.unwrap();
    assert_eq!(outbound.state(), StreamState::HalfClosed);

    let mut inbound = agent.accept_stream().await.unwrap();
    assert_eq!(inbound.metadata(), &Bytes::from("my-endpoint"));
    assert_eq!(read_to_end(&mut inbound).await.unwrap(), b"hello");

    inbound.send(Bytes::from("world")).await.unwrap();
    inbound.half_close().await.unwrap();
    assert_eq!(inbound.state(), StreamState::Closed);

    assert_eq!(read_to_end(&mut outbound).await.unwrap(), b"world");
    assert_eq!(outbound.state(), StreamState::Closed);
    assert_eq!(outbound.bytes_sent(), 5);
    assert_eq!(outbound.bytes_received(), 5);
    assert_eq!(server.stream_count(), 0);
}

#[tokio::test]
async fn test_concurrent_streams_do_not_mix() {
    init_tracing();
    let (server, agent) = connected_pair(TunnelConfig::default());
    spawn_echo(agent);

    let requests = (0..20).map(|i| {
        let server = server.clone();
        async move {
            let mut stream = server.open_stream(OPEN_TIMEOUT).await.unwrap();
            stream
                .send(Bytes::from(format!("payload-{}-", i)))
                .await
                .unwrap();
            stream.send(Bytes::from(format!("{}", i * 7))).await.unwrap();
            stream.half_close().await.unwrap();
            let body = read_to_end(&mut stream).await.unwrap();
            (i, String::from_utf8(body).unwrap())
        }
    });

    for (i, body) in futures::future::join_all(requests).await {
        assert_eq!(body, format!("payload-{}-{}", i, i * 7));
    }
}

#[tokio::test]
async fn test_unknown_stream_is_reset() {
    init_tracing();
    let (server, mut raw) = raw_peer(TunnelConfig::default());

    raw.send(Frame::data(42, "stray").encode().unwrap())
        .await
        .unwrap();

    let reply = Frame::decode(raw.recv().await.unwrap()).unwrap();
    assert_eq!(reply, Frame::reset(42, ResetReason::UnknownStream));
    assert!(server.is_active());
}

#[tokio::test]
async fn test_wrong_parity_open_is_refused() {
    init_tracing();
    let (server, mut raw) = raw_peer(TunnelConfig::default());

    // Odd ids belong to the server
    raw.send(Frame::open(3, "my-endpoint").encode().unwrap())
        .await
        .unwrap();

    let reply = Frame::decode(raw.recv().await.unwrap()).unwrap();
    assert_eq!(reply, Frame::reset(3, ResetReason::Refused));
    assert!(server.is_active());
}

#[tokio::test]
async fn test_unknown_frame_kind_closes_connection() {
    init_tracing();
    let (server, mut raw) = raw_peer(TunnelConfig::default());

    raw.send(Bytes::from_static(&[0, 0, 0, 1, 9])).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    assert_eq!(server.close_reason(), Some(CloseReason::ProtocolViolation));
}

#[tokio::test]
async fn test_close_fails_in_flight_streams() {
    init_tracing();
    let (server, agent) = connected_pair(TunnelConfig::default());

    let mut outbound = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    outbound.send(Bytes::from("partial")).await.unwrap();
    let mut inbound = agent.accept_stream().await.unwrap();
    assert_eq!(inbound.recv().await.unwrap(), Some(Bytes::from("partial")));

    server.close();

    assert_eq!(outbound.recv().await, Err(TunnelError::ConnectionClosed));
    assert_eq!(outbound.state(), StreamState::Reset);
    let err = inbound.recv().await.unwrap_err();
    assert!(matches!(
        err,
        TunnelError::StreamReset(ResetReason::ConnectionClosed) | TunnelError::ConnectionClosed
    ));

    assert!(matches!(
        server.open_stream(OPEN_TIMEOUT).await,
        Err(TunnelError::ConnectionClosed)
    ));

    tokio::time::timeout(Duration::from_secs(5), agent.closed())
        .await
        .unwrap();
    assert_eq!(agent.close_reason(), Some(CloseReason::PeerClosed));
    assert_eq!(server.close_reason(), Some(CloseReason::Local));
}

#[tokio::test]
async fn test_dropped_stream_resets_peer() {
    init_tracing();
    let (server, agent) = connected_pair(TunnelConfig::default());

    let mut outbound = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    outbound.send(Bytes::from("abandoned")).await.unwrap();

    let mut inbound = agent.accept_stream().await.unwrap();
    assert_eq!(inbound.recv().await.unwrap(), Some(Bytes::from("abandoned")));

    drop(outbound);

    assert_eq!(
        inbound.recv().await,
        Err(TunnelError::StreamReset(ResetReason::Cancelled))
    );
    assert!(server.is_active());
    assert_eq!(server.stream_count(), 0);
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_stream() {
    init_tracing();
    let (server, agent) = connected_pair(TunnelConfig::default());

    let mut outbound = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    let mut inbound = agent.accept_stream().await.unwrap();

    server.drain(Duration::from_secs(30));
    assert_eq!(server.state(), ConnectionState::Draining);
    assert!(matches!(
        server.open_stream(OPEN_TIMEOUT).await,
        Err(TunnelError::ConnectionClosed)
    ));

    outbound.send(Bytes::from("request")).await.unwrap();
    outbound.half_close().await.unwrap();
    assert_eq!(read_to_end(&mut inbound).await.unwrap(), b"request");
    inbound.send(Bytes::from("response")).await.unwrap();
    inbound.half_close().await.unwrap();

    // Still draining until the server has read the response
    assert_eq!(server.state(), ConnectionState::Draining);
    assert_eq!(read_to_end(&mut outbound).await.unwrap(), b"response");

    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    assert_eq!(server.close_reason(), Some(CloseReason::Drained));
}

#[tokio::test(start_paused = true)]
async fn test_drain_grace_elapses() {
    init_tracing();
    let (server, agent) = connected_pair(TunnelConfig::default());

    let _outbound = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    let _inbound = agent.accept_stream().await.unwrap();

    server.drain(Duration::from_secs(5));
    server.closed().await;
    assert_eq!(server.close_reason(), Some(CloseReason::Drained));
}

#[tokio::test]
async fn test_drain_without_streams_closes_immediately() {
    let (server, _agent) = connected_pair(TunnelConfig::default());

    server.drain(Duration::from_secs(30));
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(server.close_reason(), Some(CloseReason::Drained));
}

#[tokio::test(start_paused = true)]
async fn test_open_times_out_at_capacity() {
    init_tracing();
    let config = TunnelConfig::default().with_max_concurrent_streams(1);
    let (server, _agent) = connected_pair(config);

    let held = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    assert!(matches!(
        server.open_stream(Duration::from_millis(100)).await,
        Err(TunnelError::Timeout)
    ));

    drop(held);
    let next = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    assert_eq!(next.id(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_hits_keepalive_timeout() {
    init_tracing();
    let config = TunnelConfig::default()
        .with_keepalive(Duration::from_secs(1))
        .with_keepalive_timeout_factor(3);
    let (server, mut raw) = raw_peer(config);

    let first = Frame::decode(raw.recv().await.unwrap()).unwrap();
    assert!(matches!(first, Frame::Ping { .. }));

    tokio::time::timeout(Duration::from_secs(10), server.closed())
        .await
        .unwrap();
    assert_eq!(server.close_reason(), Some(CloseReason::KeepaliveTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_connection_alive() {
    init_tracing();
    let config = TunnelConfig::default()
        .with_keepalive(Duration::from_secs(1))
        .with_keepalive_timeout_factor(3);
    let (server, agent) = connected_pair(config);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(server.is_active());
    assert!(agent.is_active());
    assert!(server.stats().frames_received > 0);
}

async fn echo_round_trip(
    server: Arc<TunnelConnection>,
    chunks: usize,
    chunk_size: usize,
) -> Result<(), TunnelError> {
    let mut stream = server.open_stream(Duration::from_secs(10)).await?;
    let chunk = Bytes::from(vec![stream.id() as u8; chunk_size]);
    for _ in 0..chunks {
        stream.send(chunk.clone()).await?;
    }
    stream.half_close().await?;

    let echoed = read_to_end(&mut stream).await?;
    assert_eq!(echoed.len(), chunks * chunk_size);
    assert!(echoed.iter().all(|byte| *byte == stream.id() as u8));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_opens_are_accepted_in_order() {
    init_tracing();
    let (server, agent) = connected_pair(TunnelConfig::default());
    spawn_echo(agent.clone());

    for _ in 0..20 {
        let tasks: Vec<_> = (0..100)
            .map(|_| tokio::spawn(echo_round_trip(server.clone(), 1, 16)))
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    assert!(server.is_active());
    assert!(agent.is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_heavy_load_does_not_stall_tunnel() {
    init_tracing();
    let config = TunnelConfig::default()
        .with_stream_buffer(4)
        .with_writer_buffer(8)
        .with_keepalive(Duration::from_secs(60));
    let (server, agent) = connected_pair(config);
    spawn_echo(agent.clone());

    let tasks: Vec<_> = (0..800)
        .map(|_| tokio::spawn(echo_round_trip(server.clone(), 8, 1024)))
        .collect();

    tokio::time::timeout(Duration::from_secs(60), async {
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    })
    .await
    .expect("tunnel stalled under load");

    assert!(server.is_active());
    assert!(agent.is_active());
    assert_eq!(server.stream_count(), 0);
}

#[tokio::test]
async fn test_reset_reason_survives_full_stream_queue() {
    init_tracing();
    let (server, mut raw) = raw_peer(TunnelConfig::default().with_stream_buffer(2));

    let mut stream = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    let id = stream.id();
    let open = Frame::decode(raw.recv().await.unwrap()).unwrap();
    assert!(matches!(open, Frame::OpenStream { stream_id, .. } if stream_id == id));

    // The two data frames fill the queue, leaving no room for the reset
    raw.send(Frame::data(id, "a").encode().unwrap()).await.unwrap();
    raw.send(Frame::data(id, "b").encode().unwrap()).await.unwrap();
    raw.send(Frame::reset(id, ResetReason::Internal).encode().unwrap())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.stream_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from("a")));
    assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from("b")));
    assert_eq!(
        stream.recv().await,
        Err(TunnelError::StreamReset(ResetReason::Internal))
    );
    assert!(server.is_active());
}

#[tokio::test]
async fn test_reset_after_half_close_is_reported() {
    init_tracing();
    let (server, agent) = connected_pair(TunnelConfig::default());

    let mut outbound = server.open_stream(OPEN_TIMEOUT).await.unwrap();
    outbound.send(Bytes::from("request")).await.unwrap();
    outbound.half_close().await.unwrap();

    let mut inbound = agent.accept_stream().await.unwrap();
    assert_eq!(read_to_end(&mut inbound).await.unwrap(), b"request");

    drop(outbound);

    tokio::time::timeout(Duration::from_secs(5), async {
        while agent.stream_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        inbound.recv().await,
        Err(TunnelError::StreamReset(ResetReason::Cancelled))
    );
    assert_eq!(
        inbound.send(Bytes::from("late")).await,
        Err(TunnelError::StreamReset(ResetReason::Cancelled))
    );
}
