//! Tunnel agent: registration, stream serving and reconnects

use bytes::{Bytes, BytesMut};
use piko_proto::{validate_endpoint_id, RequestHead, ResetReason, ResponseHead, ENDPOINT_HEADER};
use piko_transport::TungsteniteTransport;
use piko_tunnel::{Role, TunnelConnection, TunnelStream};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::target::{bad_gateway, TargetClient};

/// Response bodies are written to the stream in chunks of this size
const RESPONSE_CHUNK_SIZE: usize = 64 * 1024;

pub struct Agent {
    config: AgentConfig,
    target: Arc<TargetClient>,
}

impl Agent {
    /// Validate `config` and build an agent; nothing is dialed yet
    pub fn new(config: AgentConfig) -> AgentResult<Self> {
        validate_endpoint_id(&config.endpoint_id)?;
        config.upstream_url()?;

        let target = Arc::new(TargetClient::new(
            config.target_addr.clone(),
            config.target_timeout,
        ));
        Ok(Self { config, target })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Open a tunnel to the server and register the endpoint
    pub async fn connect(&self) -> AgentResult<Arc<TunnelConnection>> {
        // Needed for wss:// only; a second install is a no-op error
        let _ = rustls::crypto::ring::default_provider().install_default();

        let url = self.config.upstream_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::InvalidUrl(e.to_string()))?;
        let endpoint = HeaderValue::from_str(&self.config.endpoint_id)
            .map_err(|e| AgentError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert(ENDPOINT_HEADER, endpoint);

        debug!("Connecting to {}", url);
        let connecting = tokio_tungstenite::connect_async(request);
        let (ws, _response) = match tokio::time::timeout(self.config.connect_timeout, connecting)
            .await
        {
            Err(_) => return Err(AgentError::ConnectTimeout),
            Ok(Err(WsError::Http(response))) => {
                return Err(AgentError::Rejected(response.status().as_u16()))
            }
            Ok(Err(e)) => return Err(AgentError::ConnectionFailed(e.to_string())),
            Ok(Ok(connected)) => connected,
        };

        let conn = TunnelConnection::spawn(
            TungsteniteTransport::new(ws),
            self.config.endpoint_id.clone(),
            Role::Agent,
            self.config.tunnel.clone(),
        );
        info!(
            endpoint_id = %self.config.endpoint_id,
            conn_id = %conn.id(),
            "Registered with {}",
            url
        );
        Ok(conn)
    }

    /// Serve streams opened by the server until the tunnel closes
    pub async fn serve(&self, conn: &Arc<TunnelConnection>) {
        while let Some(stream) = conn.accept_stream().await {
            tokio::spawn(handle_stream(self.target.clone(), stream));
        }

        info!(
            endpoint_id = %self.config.endpoint_id,
            conn_id = %conn.id(),
            reason = ?conn.close_reason(),
            "Tunnel closed"
        );
    }

    /// Connect and serve, reconnecting with exponential backoff, until
    /// `shutdown` is cancelled
    ///
    /// Returns an error only for configuration problems that reconnecting
    /// cannot fix.
    pub async fn run(&self, shutdown: CancellationToken) -> AgentResult<()> {
        let mut backoff = self.config.reconnect_min;

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = self.connect() => result,
            };

            match connected {
                Ok(conn) => {
                    backoff = self.config.reconnect_min;
                    tokio::select! {
                        _ = self.serve(&conn) => {}
                        _ = shutdown.cancelled() => {
                            info!("Shutting down, draining tunnel {}", conn.id());
                            conn.drain(self.config.tunnel.drain_grace);
                            conn.closed().await;
                            return Ok(());
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Agent cannot connect");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to {}", self.config.server_url);
                }
            }

            info!("Reconnecting in {:?}", backoff);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max);
        }
    }
}

async fn handle_stream(target: Arc<TargetClient>, mut stream: TunnelStream) {
    let stream_id = stream.id();

    let (head, body) = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(AgentError::Tunnel(e)) => {
            debug!(stream_id, "Stream failed before the request was read: {}", e);
            return;
        }
        Err(e) => {
            warn!(stream_id, error = %e, "Invalid forwarded request");
            stream.reset(ResetReason::ProtocolError).await;
            return;
        }
    };

    debug!(stream_id, method = %head.method, uri = %head.uri, "Forwarding request");
    let (response, body) = match target.send(&head, body).await {
        Ok(response) => response,
        Err(AgentError::TargetUnreachable(reason)) => {
            warn!(stream_id, target = %target.target(), "{}", reason);
            bad_gateway(&reason)
        }
        Err(e) => {
            warn!(stream_id, error = %e, "Request to target failed");
            stream.reset(ResetReason::Internal).await;
            return;
        }
    };

    if let Err(e) = write_response(&mut stream, &response, body).await {
        debug!(stream_id, "Failed to write response: {}", e);
    }
}

async fn read_request(stream: &mut TunnelStream) -> AgentResult<(RequestHead, Bytes)> {
    let head = stream
        .recv()
        .await?
        .ok_or_else(|| AgentError::Protocol("stream closed before request head".to_string()))?;
    let head = RequestHead::decode(&head)
        .map_err(|e| AgentError::Protocol(format!("invalid request head: {}", e)))?;

    let mut body = BytesMut::new();
    while let Some(chunk) = stream.recv().await? {
        body.extend_from_slice(&chunk);
    }
    Ok((head, body.freeze()))
}

async fn write_response(
    stream: &mut TunnelStream,
    head: &ResponseHead,
    mut body: Bytes,
) -> AgentResult<()> {
    let head = head
        .encode()
        .map_err(|e| AgentError::Protocol(e.to_string()))?;
    stream.send(head).await?;

    while !body.is_empty() {
        let chunk = body.split_to(body.len().min(RESPONSE_CHUNK_SIZE));
        stream.send(chunk).await?;
    }
    stream.half_close().await?;
    Ok(())
}
