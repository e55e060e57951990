//! Upstream registration over real WebSockets

use bytes::Bytes;
use piko_router::TunnelRegistry;
use piko_transport::TungsteniteTransport;
use piko_tunnel::{Role, TunnelConfig, TunnelConnection};
use piko_upstream::UpstreamServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("piko_upstream=debug,piko_tunnel=debug")
        .with_test_writer()
        .try_init();
}

async fn start_server() -> (Arc<UpstreamServer>, SocketAddr) {
    let registry = Arc::new(TunnelRegistry::new());
    let server = Arc::new(UpstreamServer::new(registry, TunnelConfig::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener, std::future::pending()).await });
    (server, addr)
}

async fn connect(addr: SocketAddr, endpoint_header: Option<&str>, query: &str) -> Arc<TunnelConnection> {
    let url = format!("ws://{}/piko/v1/upstream/ws{}", addr, query);
    let mut request = url.into_client_request().unwrap();
    if let Some(endpoint_id) = endpoint_header {
        request
            .headers_mut()
            .insert("x-piko-endpoint", endpoint_id.parse().unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    TunnelConnection::spawn(
        TungsteniteTransport::new(ws),
        endpoint_header.unwrap_or("from-query"),
        Role::Agent,
        TunnelConfig::default(),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_register_and_deregister() {
    init_tracing();
    let (server, addr) = start_server().await;
    let registry = server.registry().clone();

    let agent = connect(addr, Some("my-endpoint"), "").await;
    wait_until(|| registry.connection_count("my-endpoint") == 1).await;

    agent.close();
    wait_until(|| registry.connection_count("my-endpoint") == 0).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_register_with_query_parameter() {
    init_tracing();
    let (server, addr) = start_server().await;
    let registry = server.registry().clone();

    let _agent = connect(addr, None, "?endpoint=my-endpoint-2").await;
    wait_until(|| registry.connection_count("my-endpoint-2") == 1).await;
    assert_eq!(registry.endpoints(), vec!["my-endpoint-2".to_string()]);
}

#[tokio::test]
async fn test_registered_tunnel_carries_streams() {
    init_tracing();
    let (server, addr) = start_server().await;
    let registry = server.registry().clone();

    let agent = connect(addr, Some("my-endpoint"), "").await;
    wait_until(|| registry.connection_count("my-endpoint") == 1).await;

    tokio::spawn(async move {
        while let Some(mut stream) = agent.accept_stream().await {
            tokio::spawn(async move {
                while let Ok(Some(chunk)) = stream.recv().await {
                    stream.send(chunk).await.unwrap();
                }
                stream.half_close().await.unwrap();
            });
        }
    });

    let conn = registry.select("my-endpoint").unwrap();
    let mut stream = conn.open_stream(Duration::from_secs(1)).await.unwrap();
    stream.send(Bytes::from("ping")).await.unwrap();
    stream.half_close().await.unwrap();

    assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from("ping")));
    assert_eq!(stream.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_rejects_missing_endpoint() {
    init_tracing();
    let (_server, addr) = start_server().await;

    let response = reqwest::get(format!("http://{}/piko/v1/upstream/ws", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "missing endpoint id");
}

#[tokio::test]
async fn test_rejects_malformed_endpoint() {
    init_tracing();
    let (server, addr) = start_server().await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/piko/v1/upstream/ws", addr))
        .header("x-piko-endpoint", "not/valid")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn test_valid_endpoint_without_upgrade_is_rejected() {
    init_tracing();
    let (server, addr) = start_server().await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/piko/v1/upstream/ws", addr))
        .header("x-piko-endpoint", "my-endpoint")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());
    assert!(server.registry().is_empty());
}

#[tokio::test]
async fn test_drain_all_closes_tunnels() {
    init_tracing();
    let (server, addr) = start_server().await;
    let registry = server.registry().clone();

    let first = connect(addr, Some("my-endpoint"), "").await;
    let second = connect(addr, Some("my-endpoint-2"), "").await;
    wait_until(|| registry.len() == 2).await;

    tokio::time::timeout(Duration::from_secs(5), server.drain_all(Duration::from_secs(1)))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        first.closed().await;
        second.closed().await;
    })
    .await
    .unwrap();
    wait_until(|| registry.is_empty()).await;
}
