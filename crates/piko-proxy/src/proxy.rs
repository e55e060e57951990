//! Forwarding requests over tunnels
//!
//! A request is written to a stream as `Data(RequestHead)`, the body in
//! chunks, then `HalfClose`. The response comes back the same way: its first
//! `Data` frame holds the `ResponseHead`, the rest is body until the upstream
//! half-closes.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH};
use http::{HeaderMap, Request, Response, StatusCode};
use piko_proto::{is_hop_by_hop, RequestHead, ResetReason, ResponseHead};
use piko_router::TunnelRegistry;
use piko_tunnel::{TunnelConnection, TunnelError, TunnelStream};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Why one attempt over a tunnel failed
enum SendFailure {
    /// The upstream produced no response; another tunnel may be tried
    Retryable(String),
    Fatal(ProxyError),
}

/// Forwards HTTP requests to upstreams through the tunnel registry
pub struct ReverseProxy {
    registry: Arc<TunnelRegistry>,
    config: ProxyConfig,
}

impl ReverseProxy {
    pub fn new(registry: Arc<TunnelRegistry>, config: ProxyConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Forward a buffered request to an upstream serving `endpoint_id`
    ///
    /// Dropping the returned future resets the stream in flight.
    pub async fn forward(
        &self,
        endpoint_id: &str,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        let deadline = Instant::now() + self.config.request_timeout;
        let (parts, body) = request.into_parts();

        let head = RequestHead {
            method: parts.method.to_string(),
            uri: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            headers: forwardable_headers(&parts.headers),
        };
        let head = head
            .encode()
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        let mut tried: Vec<String> = Vec::new();
        loop {
            let conn = match self.registry.select_excluding(endpoint_id, &tried) {
                Ok(conn) => conn,
                Err(_) if tried.is_empty() => {
                    debug!(endpoint_id = %endpoint_id, "No tunnel for endpoint");
                    return Err(ProxyError::NoTunnel(endpoint_id.to_string()));
                }
                Err(_) => {
                    return Err(ProxyError::BadGateway(format!(
                        "no other upstream for endpoint {}",
                        endpoint_id
                    )))
                }
            };

            let attempt = match self.send_request(&conn, head.clone(), &body, deadline).await {
                Ok(mut stream) => {
                    self.receive_response(endpoint_id, &conn, &mut stream, deadline)
                        .await
                }
                Err(failure) => {
                    self.forget_if_dead(endpoint_id, &conn);
                    Err(failure)
                }
            };

            let reason = match attempt {
                Ok(response) => return Ok(response),
                Err(SendFailure::Fatal(e)) => return Err(e),
                Err(SendFailure::Retryable(reason)) => reason,
            };

            warn!(
                endpoint_id = %endpoint_id,
                conn_id = %conn.id(),
                error = %reason,
                "Tunnel failed before the upstream responded"
            );
            tried.push(conn.id().to_string());
            if tried.len() > self.config.max_retries {
                return Err(ProxyError::BadGateway(reason));
            }
        }
    }

    async fn send_request(
        &self,
        conn: &Arc<TunnelConnection>,
        head: Bytes,
        body: &Bytes,
        deadline: Instant,
    ) -> Result<TunnelStream, SendFailure> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SendFailure::Fatal(ProxyError::UpstreamTimeout));
        }

        let mut stream = conn
            .open_stream(self.config.open_timeout.min(remaining))
            .await
            .map_err(|e| SendFailure::Retryable(e.to_string()))?;

        let chunk_size = self.config.body_chunk_size.max(1);
        let write = async {
            stream.send(head).await?;
            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + chunk_size).min(body.len());
                stream.send(body.slice(offset..end)).await?;
                offset = end;
            }
            stream.half_close().await
        };

        match tokio::time::timeout_at(deadline, write).await {
            Ok(Ok(())) => Ok(stream),
            // Dropping the unfinished stream resets it
            Ok(Err(e)) => Err(SendFailure::Retryable(e.to_string())),
            Err(_) => {
                stream.reset(ResetReason::Timeout).await;
                Err(SendFailure::Fatal(ProxyError::UpstreamTimeout))
            }
        }
    }

    async fn receive_response(
        &self,
        endpoint_id: &str,
        conn: &Arc<TunnelConnection>,
        stream: &mut TunnelStream,
        deadline: Instant,
    ) -> Result<Response<Bytes>, SendFailure> {
        let result = tokio::time::timeout_at(deadline, self.read_response(stream)).await;

        let failure = match result {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(failure)) => failure,
            Err(_) => SendFailure::Fatal(ProxyError::UpstreamTimeout),
        };

        if let SendFailure::Fatal(err) = &failure {
            match err {
                ProxyError::UpstreamTimeout => stream.reset(ResetReason::Timeout).await,
                ProxyError::BadGateway(_) => stream.reset(ResetReason::ProtocolError).await,
                _ => {}
            }
            warn!(
                endpoint_id = %endpoint_id,
                conn_id = %conn.id(),
                stream_id = stream.id(),
                error = %err,
                "Proxied request failed"
            );
        }
        self.forget_if_dead(endpoint_id, conn);
        Err(failure)
    }

    async fn read_response(&self, stream: &mut TunnelStream) -> Result<Response<Bytes>, SendFailure> {
        let head = match stream.recv().await {
            Ok(Some(head)) => head,
            Ok(None) => {
                return Err(SendFailure::Fatal(ProxyError::BadGateway(
                    "upstream closed without a response".to_string(),
                )))
            }
            // Nothing came back yet, so the upstream may never have seen it
            Err(e) if is_connection_loss(&e) => return Err(SendFailure::Retryable(e.to_string())),
            Err(e) => return Err(SendFailure::Fatal(ProxyError::UpstreamReset(e.to_string()))),
        };
        let head = ResponseHead::decode(&head).map_err(|e| {
            SendFailure::Fatal(ProxyError::BadGateway(format!("invalid response head: {}", e)))
        })?;

        let mut body = BytesMut::new();
        loop {
            match stream.recv().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > self.config.max_response_body {
                        return Err(SendFailure::Fatal(ProxyError::BadGateway(
                            "response body too large".to_string(),
                        )));
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(SendFailure::Fatal(ProxyError::UpstreamReset(e.to_string())))
                }
            }
        }

        build_response(head, body.freeze()).map_err(SendFailure::Fatal)
    }

    /// Drop a connection from the registry once it can no longer serve
    fn forget_if_dead(&self, endpoint_id: &str, conn: &TunnelConnection) {
        if !conn.is_active() {
            self.registry.remove(endpoint_id, conn);
        }
    }
}

/// The tunnel went away or refused the stream, as opposed to the upstream
/// aborting the exchange
fn is_connection_loss(err: &TunnelError) -> bool {
    matches!(
        err,
        TunnelError::ConnectionClosed
            | TunnelError::StreamReset(ResetReason::ConnectionClosed)
            | TunnelError::StreamReset(ResetReason::Refused)
    )
}

/// Header pairs of a request minus hop-by-hop headers and `content-length`
fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut headers = headers.clone();
    strip_hop_by_hop(&mut headers);
    headers
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(value) => Some((name.to_string(), value.to_string())),
            Err(_) => {
                debug!("Dropping non-text header {}", name);
                None
            }
        })
        .collect()
}

/// Remove hop-by-hop headers, including any named by `Connection`, and
/// `content-length`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }

    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(&name);
    }
    headers.remove(CONTENT_LENGTH);
}

fn build_response(head: ResponseHead, body: Bytes) -> Result<Response<Bytes>, ProxyError> {
    let status = StatusCode::from_u16(head.status)
        .map_err(|_| ProxyError::BadGateway(format!("invalid status {}", head.status)))?;

    let mut headers = HeaderMap::with_capacity(head.headers.len());
    for (name, value) in &head.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!("Dropping invalid response header {}", name),
        }
    }
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
