//! Tunnel Protocol Definitions
//!
//! This crate defines the wire frames multiplexed over an upstream tunnel and
//! the request/response heads carried inside them.

pub mod endpoint;
pub mod frame;
pub mod messages;

pub use endpoint::{validate_endpoint_id, EndpointIdError, MAX_ENDPOINT_ID_LEN};
pub use frame::{Frame, FrameError, FrameKind, ResetReason, StreamId};
pub use messages::{is_hop_by_hop, CodecError, RequestHead, ResponseHead, HOP_BY_HOP_HEADERS};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reserved stream ID for connection-level frames (ping/pong)
pub const CONTROL_STREAM_ID: StreamId = 0;

/// Path upstreams connect to when registering a tunnel
pub const UPSTREAM_PATH: &str = "/piko/v1/upstream/ws";

/// Header carrying the endpoint identifier, both on upstream registration and
/// on proxied requests
pub const ENDPOINT_HEADER: &str = "x-piko-endpoint";
