use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use piko_proto::EndpointIdError;
use thiserror::Error;

/// Registration errors, reported before the WebSocket upgrade
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("missing endpoint id")]
    MissingEndpoint,

    #[error("invalid endpoint id: {0}")]
    InvalidEndpoint(#[from] EndpointIdError),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
