//! Request and response heads carried over a stream
//!
//! A forwarded request is the sequence `Data(RequestHead)`, zero or more
//! `Data(body chunk)`, `HalfClose`. The response mirrors it with a
//! `ResponseHead` as its first `Data` frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Headers scoped to a single HTTP connection; never forwarded
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

/// Method, target and headers of a forwarded request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path and query, e.g. `/foo/bar?a=b`
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

/// Status and headers of a forwarded response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl ResponseHead {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let payload = bincode::serialize(value)?;
    if payload.len() > crate::MAX_FRAME_SIZE {
        return Err(CodecError::MessageTooLarge(payload.len()));
    }
    Ok(Bytes::from(payload))
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
