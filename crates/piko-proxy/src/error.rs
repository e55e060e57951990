//! Proxy errors and their HTTP mapping

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Why a proxied request failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// No upstream is connected for the endpoint
    #[error("no upstream available for endpoint: {0}")]
    NoTunnel(String),

    #[error("upstream timeout")]
    UpstreamTimeout,

    /// The tunnel failed after the request was sent
    #[error("upstream reset: {0}")]
    UpstreamReset(String),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("missing endpoint id")]
    MissingEndpoint,

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoTunnel(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamReset(_) | ProxyError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ProxyError::MissingEndpoint | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// JSON body of every error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::NoTunnel("my-endpoint".to_string()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::UpstreamReset("connection closed".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::BadGateway("invalid head".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyError::MissingEndpoint.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_error_body_is_json() {
        let body = serde_json::to_string(&ErrorResponse::new("upstream timeout")).unwrap();
        assert_eq!(body, r#"{"error":"upstream timeout"}"#);
    }
}
