//! HTTP client for the local target service
//!
//! Uses hyper HTTP/1 connections kept in a small pool so consecutive
//! forwarded requests reuse the same TCP connection.

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST};
use http::response::Parts;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use piko_proto::{is_hop_by_hop, RequestHead, ResponseHead};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// Maximum number of pooled connections to the target
const MAX_POOL_SIZE: usize = 10;

pub struct TargetClient {
    /// Target address (host:port)
    target: String,
    timeout: Duration,
    pool: Mutex<Vec<http1::SendRequest<Full<Bytes>>>>,
}

impl TargetClient {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
            pool: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Send a request to the target and buffer the whole response
    ///
    /// Fails with [`AgentError::TargetUnreachable`] when no connection to
    /// the target can be made.
    pub async fn send(
        &self,
        head: &RequestHead,
        body: Bytes,
    ) -> AgentResult<(ResponseHead, Bytes)> {
        let request = build_request(head, body, &self.target)?;
        let mut sender = self.get_connection().await?;

        let exchange = async {
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| AgentError::TargetRequest(e.to_string()))?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| {
                    AgentError::TargetRequest(format!("Failed to read response body: {}", e))
                })?
                .to_bytes();
            Ok::<_, AgentError>((parts, body))
        };

        let (parts, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| AgentError::TargetRequest("request timed out".to_string()))??;

        self.return_connection(sender).await;
        Ok((response_head(&parts), body))
    }

    async fn get_connection(&self) -> AgentResult<http1::SendRequest<Full<Bytes>>> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                if sender.is_ready() {
                    debug!("Reusing pooled connection to {}", self.target);
                    return Ok(sender);
                }
                debug!("Discarding stale connection from pool");
            }
        }

        debug!("Creating new connection to {}", self.target);
        let stream = TcpStream::connect(&self.target).await.map_err(|e| {
            AgentError::TargetUnreachable(format!("Failed to connect to {}: {}", self.target, e))
        })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| AgentError::TargetUnreachable(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Target connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    async fn return_connection(&self, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            return;
        }

        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
        }
    }
}

fn build_request(head: &RequestHead, body: Bytes, target: &str) -> AgentResult<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(head.method.as_str())
        .uri(head.uri.as_str());

    let mut has_host = false;
    for (name, value) in &head.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()) {
            continue;
        }
        has_host |= name.eq_ignore_ascii_case(HOST.as_str());
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !has_host {
        builder = builder.header(HOST, target);
    }

    builder
        .body(Full::new(body))
        .map_err(|e| AgentError::Protocol(format!("Failed to build request: {}", e)))
}

fn response_head(parts: &Parts) -> ResponseHead {
    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()) && **name != CONTENT_LENGTH)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect();

    ResponseHead {
        status: parts.status.as_u16(),
        headers,
    }
}

/// A `502` reply for when the target cannot be reached
pub(crate) fn bad_gateway(reason: &str) -> (ResponseHead, Bytes) {
    let head = ResponseHead {
        status: 502,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
    };
    let body = serde_json::json!({ "error": format!("upstream unavailable: {}", reason) });
    (head, Bytes::from(body.to_string()))
}
