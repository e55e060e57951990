//! Piko - expose HTTP services behind NAT through outbound tunnels
//!
//! `piko server` runs the public proxy and the upstream listener.
//! `piko agent` connects a local HTTP service to a server.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::{Args, Parser, Subcommand};
use piko_agent::{Agent, AgentConfig};
use piko_proxy::{PrometheusProxyMetrics, ProxyConfig, ProxyServer};
use piko_router::TunnelRegistry;
use piko_tunnel::TunnelConfig;
use piko_upstream::{PrometheusUpstreamMetrics, UpstreamServer};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "piko")]
#[command(about = "Piko - reverse proxy for services behind NAT")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, env = "PIKO_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy and upstream listeners
    #[command(long_about = r#"
Run the piko server. Upstreams connect to the upstream listener and register
an endpoint; HTTP requests on the proxy listener are forwarded to them.

EXAMPLES:
  piko server --proxy-addr 0.0.0.0:8000 --upstream-addr 0.0.0.0:8001

  curl -H "x-piko-endpoint: my-endpoint" http://localhost:8000/foo/bar

ENVIRONMENT VARIABLES:
  PIKO_PROXY_ADDR     Proxy listen address
  PIKO_UPSTREAM_ADDR  Upstream listen address
  PIKO_ADMIN_ADDR     Admin (metrics, health) listen address
    "#)]
    Server(ServerArgs),

    /// Register an endpoint and forward its requests to a local service
    #[command(long_about = r#"
Connect to a piko server, register an endpoint and forward every request for
it to a local HTTP service. Reconnects automatically if the tunnel drops.

EXAMPLES:
  piko agent --server-url ws://localhost:8001 \
    --endpoint-id my-endpoint \
    --target-addr localhost:3000

ENVIRONMENT VARIABLES:
  PIKO_SERVER_URL   Server upstream URL
  PIKO_ENDPOINT_ID  Endpoint to register
  PIKO_TARGET_ADDR  Local service address
    "#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address for proxied HTTP traffic
    #[arg(long, env = "PIKO_PROXY_ADDR", default_value = "0.0.0.0:8000")]
    proxy_addr: SocketAddr,

    /// Address upstreams connect to
    #[arg(long, env = "PIKO_UPSTREAM_ADDR", default_value = "0.0.0.0:8001")]
    upstream_addr: SocketAddr,

    /// Address serving /metrics and /health
    #[arg(long, env = "PIKO_ADMIN_ADDR", default_value = "0.0.0.0:8002")]
    admin_addr: SocketAddr,

    /// Deadline for a proxied request, response included
    #[arg(long, env = "PIKO_REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// How many other tunnels to try when a stream cannot be opened
    #[arg(long, env = "PIKO_MAX_RETRIES", default_value = "1")]
    max_retries: usize,

    /// Ping idle tunnels this often (0 disables keepalive)
    #[arg(long, env = "PIKO_KEEPALIVE_INTERVAL_SECS", default_value = "30")]
    keepalive_interval_secs: u64,

    /// Concurrent streams allowed per tunnel
    #[arg(long, env = "PIKO_MAX_STREAMS", default_value = "1024")]
    max_streams: usize,

    /// Time in-flight requests get to finish on shutdown
    #[arg(long, env = "PIKO_DRAIN_GRACE_SECS", default_value = "30")]
    drain_grace_secs: u64,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Server upstream URL (e.g. ws://piko.example.com:8001)
    #[arg(long, env = "PIKO_SERVER_URL")]
    server_url: String,

    /// Endpoint to register
    #[arg(long, env = "PIKO_ENDPOINT_ID")]
    endpoint_id: String,

    /// Local HTTP service to forward to (host:port)
    #[arg(long, env = "PIKO_TARGET_ADDR")]
    target_addr: String,

    /// Ping the server this often (0 disables keepalive)
    #[arg(long, env = "PIKO_KEEPALIVE_INTERVAL_SECS", default_value = "30")]
    keepalive_interval_secs: u64,

    /// Longest delay between reconnect attempts
    #[arg(long, env = "PIKO_RECONNECT_MAX_SECS", default_value = "30")]
    reconnect_max_secs: u64,
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `shutdown` on Ctrl+C
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });
}

struct AdminState {
    registry: Arc<TunnelRegistry>,
    metrics: prometheus::Registry,
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&state.metrics.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "endpoints": state.registry.endpoints().len(),
        "connections": state.registry.len(),
    }))
}

async fn bind(addr: SocketAddr, name: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} listener on {}", name, addr))
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let registry = Arc::new(TunnelRegistry::new());
    let metrics = prometheus::Registry::new();

    let tunnel_config = TunnelConfig::default()
        .with_keepalive(Duration::from_secs(args.keepalive_interval_secs))
        .with_max_concurrent_streams(args.max_streams)
        .with_drain_grace(Duration::from_secs(args.drain_grace_secs));
    let proxy_config = ProxyConfig::default()
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .with_max_retries(args.max_retries);

    let proxy = ProxyServer::new(registry.clone(), proxy_config).with_metrics(Arc::new(
        PrometheusProxyMetrics::new(&metrics).context("Failed to register proxy metrics")?,
    ));
    let upstream = Arc::new(
        UpstreamServer::new(registry.clone(), tunnel_config).with_metrics(Arc::new(
            PrometheusUpstreamMetrics::new(&metrics)
                .context("Failed to register upstream metrics")?,
        )),
    );
    let admin = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(AdminState {
            registry: registry.clone(),
            metrics,
        }));

    let proxy_listener = bind(args.proxy_addr, "proxy").await?;
    let upstream_listener = bind(args.upstream_addr, "upstream").await?;
    let admin_listener = bind(args.admin_addr, "admin").await?;
    info!("Admin server listening on {}", args.admin_addr);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let proxy_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = proxy
                .serve(proxy_listener, shutdown.clone().cancelled_owned())
                .await;
            shutdown.cancel();
            result
        })
    };
    let upstream_task = {
        let shutdown = shutdown.clone();
        let upstream = upstream.clone();
        tokio::spawn(async move {
            let result = upstream
                .serve(upstream_listener, shutdown.clone().cancelled_owned())
                .await;
            shutdown.cancel();
            result
        })
    };
    let admin_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(admin_listener, admin)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await;
            shutdown.cancel();
            result
        })
    };

    shutdown.cancelled().await;
    upstream
        .drain_all(Duration::from_secs(args.drain_grace_secs))
        .await;

    for (name, task) in [
        ("proxy", proxy_task),
        ("upstream", upstream_task),
        ("admin", admin_task),
    ] {
        task.await
            .with_context(|| format!("{} server task panicked", name))?
            .with_context(|| format!("{} server failed", name))?;
    }

    info!("Piko server stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let tunnel_config =
        TunnelConfig::default().with_keepalive(Duration::from_secs(args.keepalive_interval_secs));
    let config = AgentConfig::new(&args.server_url, &args.endpoint_id, &args.target_addr)
        .with_tunnel_config(tunnel_config)
        .with_reconnect_backoff(
            Duration::from_millis(500),
            Duration::from_secs(args.reconnect_max_secs),
        );
    let agent = Agent::new(config).context("Invalid agent configuration")?;

    info!("Endpoint: {}", args.endpoint_id);
    info!("Server: {}", args.server_url);
    info!("Target: {}", args.target_addr);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    agent.run(shutdown).await.context("Agent stopped")?;
    info!("Piko agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
    }
}
