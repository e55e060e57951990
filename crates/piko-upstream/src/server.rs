//! Upstream registration server

use axum::body::Body;
use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::future::join_all;
use futures::FutureExt;
use http::{HeaderMap, StatusCode, Uri};
use piko_proto::{validate_endpoint_id, ENDPOINT_HEADER, UPSTREAM_PATH};
use piko_router::TunnelRegistry;
use piko_transport::AxumWebSocketTransport;
use piko_tunnel::{panic_message, CloseReason, Role, TunnelConfig, TunnelConnection};
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::error::{UpstreamError, UpstreamResult};
use crate::metrics::{NoopUpstreamMetrics, UpstreamMetrics};

/// Query parameter carrying the endpoint id when the header is absent
const ENDPOINT_QUERY_PARAM: &str = "endpoint";

struct UpstreamState {
    registry: Arc<TunnelRegistry>,
    tunnel_config: TunnelConfig,
    metrics: Arc<dyn UpstreamMetrics>,
}

/// Accepts tunnels from upstreams and keeps the registry in sync with them
pub struct UpstreamServer {
    state: Arc<UpstreamState>,
}

impl UpstreamServer {
    pub fn new(registry: Arc<TunnelRegistry>, tunnel_config: TunnelConfig) -> Self {
        Self {
            state: Arc::new(UpstreamState {
                registry,
                tunnel_config,
                metrics: Arc::new(NoopUpstreamMetrics),
            }),
        }
    }

    pub fn with_metrics(self, metrics: Arc<dyn UpstreamMetrics>) -> Self {
        Self {
            state: Arc::new(UpstreamState {
                registry: self.state.registry.clone(),
                tunnel_config: self.state.tunnel_config.clone(),
                metrics,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.state.registry
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(UPSTREAM_PATH, get(upstream_handler))
            .with_state(self.state.clone())
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves
    ///
    /// Upgraded tunnels outlive the listener; use [`Self::drain_all`] to
    /// take them down.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        info!("Upstream server listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }

    /// Drain every registered tunnel and wait for all of them to close
    ///
    /// In-flight streams get up to `grace` to finish.
    pub async fn drain_all(&self, grace: Duration) {
        let connections = self.state.registry.connections();
        info!(
            "Draining {} upstream tunnel(s) with {:?} grace",
            connections.len(),
            grace
        );

        for conn in &connections {
            conn.drain(grace);
        }
        join_all(connections.iter().map(|conn| conn.closed())).await;
    }
}

/// Endpoint id from the `x-piko-endpoint` header, falling back to the
/// `endpoint` query parameter
fn endpoint_id_from(headers: &HeaderMap, uri: &Uri) -> UpstreamResult<String> {
    let from_header = headers
        .get(ENDPOINT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let endpoint_id = from_header
        .or_else(|| {
            uri.query().and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == ENDPOINT_QUERY_PARAM)
                    .map(|(_, value)| value.into_owned())
            })
        })
        .ok_or(UpstreamError::MissingEndpoint)?;

    validate_endpoint_id(&endpoint_id)?;
    Ok(endpoint_id)
}

async fn upstream_handler(State(state): State<Arc<UpstreamState>>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let endpoint_id = match endpoint_id_from(&parts.headers, &parts.uri) {
        Ok(endpoint_id) => endpoint_id,
        Err(e) => {
            warn!(remote_addr = ?remote_addr, error = %e, "Rejected upstream registration");
            return e.into_response();
        }
    };

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(endpoint_id = %endpoint_id, "Upstream request is not a WebSocket upgrade");
            return rejection.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(state, socket, endpoint_id, remote_addr))
}

async fn handle_socket(
    state: Arc<UpstreamState>,
    socket: WebSocket,
    endpoint_id: String,
    remote_addr: Option<SocketAddr>,
) {
    let conn = TunnelConnection::spawn(
        AxumWebSocketTransport::new(socket),
        &endpoint_id,
        Role::Server,
        state.tunnel_config.clone(),
    );

    state.registry.add(&endpoint_id, conn.clone());
    state.metrics.connection_opened(&endpoint_id);
    info!(
        endpoint_id = %endpoint_id,
        conn_id = %conn.id(),
        remote_addr = ?remote_addr,
        "Upstream connected"
    );

    let outcome = AssertUnwindSafe(watch_tunnel(&conn)).catch_unwind().await;
    if let Err(panic) = outcome {
        error!(
            endpoint_id = %endpoint_id,
            conn_id = %conn.id(),
            panic = %panic_message(&*panic),
            "Upstream tunnel task panicked"
        );
        conn.close();
    }

    // Selection may already have pruned the closed connection
    state.registry.remove(&endpoint_id, &conn);
    let reason = conn.close_reason().unwrap_or(CloseReason::Local);
    state.metrics.connection_closed(&endpoint_id, reason.as_str());
}

async fn watch_tunnel(conn: &TunnelConnection) {
    conn.closed().await;

    let stats = conn.stats();
    info!(
        endpoint_id = %conn.endpoint_id(),
        conn_id = %conn.id(),
        reason = %conn.close_reason().unwrap_or(CloseReason::Local),
        uptime_secs = stats.uptime_secs,
        "Upstream disconnected"
    );
    debug!(
        conn_id = %conn.id(),
        "Tunnel sent {} bytes in {} frames, received {} bytes in {} frames",
        stats.bytes_sent,
        stats.frames_sent,
        stats.bytes_received,
        stats.frames_received
    );
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    error!(panic = %panic_message(&*panic), "Upstream handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({ "error": "internal server error" })),
    )
        .into_response()
}
