//! Proxy ingress server
//!
//! Every request on the proxy listener is resolved to an endpoint and
//! forwarded over one of its tunnels.

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{HeaderValue, HOST};
use http::StatusCode;
use http_body_util::LengthLimitError;
use piko_router::{default_resolver, EndpointResolver, TunnelRegistry};
use piko_tunnel::panic_message;
use std::any::Any;
use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ErrorResponse, ProxyError};
use crate::metrics::{NoopProxyMetrics, ProxyMetrics};
use crate::proxy::ReverseProxy;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Status recorded for a request whose client went away first
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Clone)]
struct ProxyState {
    proxy: Arc<ReverseProxy>,
    resolver: Arc<dyn EndpointResolver>,
    metrics: Arc<dyn ProxyMetrics>,
}

/// HTTP server in front of the reverse proxy
pub struct ProxyServer {
    proxy: Arc<ReverseProxy>,
    resolver: Arc<dyn EndpointResolver>,
    metrics: Arc<dyn ProxyMetrics>,
}

impl ProxyServer {
    pub fn new(registry: Arc<TunnelRegistry>, config: ProxyConfig) -> Self {
        Self {
            proxy: Arc::new(ReverseProxy::new(registry, config)),
            resolver: Arc::new(default_resolver()),
            metrics: Arc::new(NoopProxyMetrics),
        }
    }

    pub fn with_resolver(mut self, resolver: impl EndpointResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn ProxyMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn proxy(&self) -> &Arc<ReverseProxy> {
        &self.proxy
    }

    /// Build the router; every path goes to the proxy handler
    pub fn router(&self) -> axum::Router {
        let state = ProxyState {
            proxy: self.proxy.clone(),
            resolver: self.resolver.clone(),
            metrics: self.metrics.clone(),
        };

        axum::Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        info!("Proxy server listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }
}

async fn proxy_handler(State(state): State<ProxyState>, request: Request) -> Response {
    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let (mut parts, body) = request.into_parts();

    let Some(endpoint_id) = state.resolver.resolve(&parts) else {
        warn!(uri = %parts.uri, "Request without endpoint id");
        return ProxyError::MissingEndpoint.into_response();
    };

    let mut record = RequestRecord::start(
        state.metrics.clone(),
        endpoint_id.clone(),
        parts.method.to_string(),
    );

    let max_body = state.proxy.config().max_request_body;
    record.request_bytes = approximate_head_size(&parts);
    let response = match axum::body::to_bytes(body, max_body).await {
        Ok(body) => {
            record.request_bytes += body.len();
            add_forwarded_headers(&mut parts, client_addr);
            let request = http::Request::from_parts(parts, body);
            match state.proxy.forward(&endpoint_id, request).await {
                Ok(response) => response.map(Body::from),
                Err(e) => {
                    warn!(endpoint_id = %endpoint_id, error = %e, "Failed to proxy request");
                    e.into_response()
                }
            }
        }
        Err(e) if is_length_limit(&e) => ProxyError::PayloadTooLarge.into_response(),
        Err(e) => ProxyError::InvalidRequest(e.to_string()).into_response(),
    };

    let response_bytes = response.body().size_hint().exact().unwrap_or(0) as usize;
    record.finish(response.status().as_u16(), response_bytes);
    response
}

/// One request as seen by the metrics
///
/// Reported when dropped, so a handler cancelled by a client disconnect
/// still leaves the in-flight count.
struct RequestRecord {
    metrics: Arc<dyn ProxyMetrics>,
    endpoint_id: String,
    method: String,
    started: Instant,
    request_bytes: usize,
    outcome: Option<(u16, usize)>,
}

impl RequestRecord {
    fn start(metrics: Arc<dyn ProxyMetrics>, endpoint_id: String, method: String) -> Self {
        metrics.request_started(&endpoint_id);
        Self {
            metrics,
            endpoint_id,
            method,
            started: Instant::now(),
            request_bytes: 0,
            outcome: None,
        }
    }

    fn finish(mut self, status: u16, response_bytes: usize) {
        self.outcome = Some((status, response_bytes));
    }
}

impl Drop for RequestRecord {
    fn drop(&mut self) {
        let (status, response_bytes) = self.outcome.unwrap_or((CLIENT_CLOSED_REQUEST, 0));
        self.metrics.request_finished(
            &self.endpoint_id,
            &self.method,
            status,
            self.started.elapsed(),
            self.request_bytes,
            response_bytes,
        );
    }
}

/// Append the client address to `x-forwarded-for` and record the original
/// host in `x-forwarded-host`
fn add_forwarded_headers(parts: &mut http::request::Parts, client_addr: Option<SocketAddr>) {
    if let Some(addr) = client_addr {
        let client_ip = addr.ip().to_string();
        let forwarded_for = match parts
            .headers
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        {
            Some(existing) => format!("{}, {}", existing, client_ip),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if !parts.headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = parts.headers.get(HOST).cloned() {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
    }
}

fn approximate_head_size(parts: &http::request::Parts) -> usize {
    let headers: usize = parts
        .headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum();
    parts.uri.to_string().len() + parts.method.as_str().len() + headers
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err as &(dyn StdError + 'static));
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    error!(panic = %panic_message(panic.as_ref()), "Proxy handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("internal server error")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_headers_append() {
        let (mut parts, _) = http::Request::get("/foo")
            .header("host", "my-endpoint.example.com")
            .header("x-forwarded-for", "10.0.0.1")
            .body(())
            .unwrap()
            .into_parts();

        add_forwarded_headers(&mut parts, Some("192.168.1.5:40000".parse().unwrap()));

        assert_eq!(parts.headers["x-forwarded-for"], "10.0.0.1, 192.168.1.5");
        assert_eq!(parts.headers["x-forwarded-host"], "my-endpoint.example.com");
    }

    #[derive(Default)]
    struct RecordingMetrics {
        started: std::sync::Mutex<usize>,
        finished: std::sync::Mutex<Vec<(String, u16)>>,
    }

    impl ProxyMetrics for RecordingMetrics {
        fn request_started(&self, _endpoint_id: &str) {
            *self.started.lock().unwrap() += 1;
        }

        fn request_finished(
            &self,
            _endpoint_id: &str,
            method: &str,
            status: u16,
            _latency: std::time::Duration,
            _request_bytes: usize,
            _response_bytes: usize,
        ) {
            self.finished
                .lock()
                .unwrap()
                .push((method.to_string(), status));
        }
    }

    #[test]
    fn test_request_record_reports_once() {
        let metrics = Arc::new(RecordingMetrics::default());

        let record = RequestRecord::start(metrics.clone(), "my-endpoint".into(), "GET".into());
        record.finish(200, 5);

        assert_eq!(*metrics.started.lock().unwrap(), 1);
        assert_eq!(
            *metrics.finished.lock().unwrap(),
            vec![("GET".to_string(), 200)]
        );
    }

    #[test]
    fn test_dropped_request_record_is_client_closed() {
        let metrics = Arc::new(RecordingMetrics::default());

        let record = RequestRecord::start(metrics.clone(), "my-endpoint".into(), "POST".into());
        drop(record);

        assert_eq!(
            *metrics.finished.lock().unwrap(),
            vec![("POST".to_string(), CLIENT_CLOSED_REQUEST)]
        );
    }

    #[test]
    fn test_panic_response_is_500() {
        let response = handle_panic(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_approximate_head_size() {
        let (parts, _) = http::Request::get("/foo?a=b")
            .header("x-piko-endpoint", "my-endpoint")
            .body(())
            .unwrap()
            .into_parts();

        assert_eq!(approximate_head_size(&parts), 8 + 3 + 15 + 11);
    }
}
