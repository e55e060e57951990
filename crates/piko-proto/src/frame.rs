//! Multiplexing frames for the tunnel protocol
//!
//! The transport (a WebSocket connection) already delimits messages, so every
//! message carries exactly one frame and no length prefix is needed.
//!
//! Frame format:
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: frame kind
//! - Rest: payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame kinds for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    OpenStream = 0,
    Data = 1,
    HalfClose = 2,
    Reset = 3,
    Ping = 4,
    Pong = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::OpenStream),
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::HalfClose),
            3 => Ok(FrameKind::Reset),
            4 => Ok(FrameKind::Ping),
            5 => Ok(FrameKind::Pong),
            _ => Err(FrameError::UnknownKind(value)),
        }
    }
}

/// Why a stream was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetReason {
    ConnectionClosed,
    Cancelled,
    UnknownStream,
    Timeout,
    ProtocolError,
    Refused,
    Internal,
    /// A code this version does not know about
    Other(u8),
}

impl ResetReason {
    pub fn code(&self) -> u8 {
        match self {
            ResetReason::ConnectionClosed => 1,
            ResetReason::Cancelled => 2,
            ResetReason::UnknownStream => 3,
            ResetReason::Timeout => 4,
            ResetReason::ProtocolError => 5,
            ResetReason::Refused => 6,
            ResetReason::Internal => 7,
            ResetReason::Other(code) => *code,
        }
    }
}

impl From<u8> for ResetReason {
    fn from(code: u8) -> Self {
        match code {
            1 => ResetReason::ConnectionClosed,
            2 => ResetReason::Cancelled,
            3 => ResetReason::UnknownStream,
            4 => ResetReason::Timeout,
            5 => ResetReason::ProtocolError,
            6 => ResetReason::Refused,
            7 => ResetReason::Internal,
            other => ResetReason::Other(other),
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetReason::ConnectionClosed => write!(f, "connection closed"),
            ResetReason::Cancelled => write!(f, "cancelled"),
            ResetReason::UnknownStream => write!(f, "unknown stream"),
            ResetReason::Timeout => write!(f, "timeout"),
            ResetReason::ProtocolError => write!(f, "protocol error"),
            ResetReason::Refused => write!(f, "refused"),
            ResetReason::Internal => write!(f, "internal error"),
            ResetReason::Other(code) => write!(f, "reset code {}", code),
        }
    }
}

/// Frame codec errors
///
/// Every variant is a protocol violation: the connection that produced the
/// bytes can no longer be trusted and must be closed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Truncated frame: {0} bytes")]
    Truncated(usize),

    #[error("Malformed {kind:?} payload")]
    MalformedPayload { kind: FrameKind },

    #[error("{kind:?} frame on stream 0")]
    MissingStreamId { kind: FrameKind },
}

/// A decoded multiplexing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    OpenStream {
        stream_id: StreamId,
        metadata: Bytes,
    },
    Data {
        stream_id: StreamId,
        payload: Bytes,
    },
    HalfClose {
        stream_id: StreamId,
    },
    Reset {
        stream_id: StreamId,
        reason: ResetReason,
        detail: String,
    },
    Ping {
        token: u64,
    },
    Pong {
        token: u64,
    },
}

impl Frame {
    /// Frame header size: stream_id (4) + kind (1) = 5 bytes
    pub const HEADER_SIZE: usize = 5;

    pub fn open(stream_id: StreamId, metadata: impl Into<Bytes>) -> Self {
        Frame::OpenStream {
            stream_id,
            metadata: metadata.into(),
        }
    }

    pub fn data(stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Frame::Data {
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn half_close(stream_id: StreamId) -> Self {
        Frame::HalfClose { stream_id }
    }

    pub fn reset(stream_id: StreamId, reason: ResetReason) -> Self {
        Frame::Reset {
            stream_id,
            reason,
            detail: String::new(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::OpenStream { .. } => FrameKind::OpenStream,
            Frame::Data { .. } => FrameKind::Data,
            Frame::HalfClose { .. } => FrameKind::HalfClose,
            Frame::Reset { .. } => FrameKind::Reset,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::Pong { .. } => FrameKind::Pong,
        }
    }

    /// Stream the frame belongs to; 0 for ping/pong
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::OpenStream { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::HalfClose { stream_id }
            | Frame::Reset { stream_id, .. } => *stream_id,
            Frame::Ping { .. } | Frame::Pong { .. } => crate::CONTROL_STREAM_ID,
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = match self {
            Frame::OpenStream { metadata, .. } => metadata.len(),
            Frame::Data { payload, .. } => payload.len(),
            Frame::HalfClose { .. } => 0,
            Frame::Reset { detail, .. } => 1 + detail.len(),
            Frame::Ping { .. } | Frame::Pong { .. } => 8,
        };
        if payload_len > crate::MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id());
        buf.put_u8(self.kind() as u8);

        match self {
            Frame::OpenStream { metadata, .. } => buf.put(metadata.clone()),
            Frame::Data { payload, .. } => buf.put(payload.clone()),
            Frame::HalfClose { .. } => {}
            Frame::Reset { reason, detail, .. } => {
                buf.put_u8(reason.code());
                buf.put(detail.as_bytes());
            }
            Frame::Ping { token } | Frame::Pong { token } => buf.put_u64(*token),
        }

        Ok(buf.freeze())
    }

    /// Decode frame from one transport message
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::Truncated(buf.len()));
        }
        if buf.len() - Self::HEADER_SIZE > crate::MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(buf.len() - Self::HEADER_SIZE));
        }

        let stream_id = buf.get_u32();
        let kind = FrameKind::try_from(buf.get_u8())?;

        let frame = match kind {
            FrameKind::OpenStream => Frame::OpenStream {
                stream_id,
                metadata: buf,
            },
            FrameKind::Data => Frame::Data {
                stream_id,
                payload: buf,
            },
            FrameKind::HalfClose => Frame::HalfClose { stream_id },
            FrameKind::Reset => {
                if !buf.has_remaining() {
                    return Err(FrameError::MalformedPayload { kind });
                }
                let reason = ResetReason::from(buf.get_u8());
                let detail = String::from_utf8(buf.to_vec())
                    .map_err(|_| FrameError::MalformedPayload { kind })?;
                Frame::Reset {
                    stream_id,
                    reason,
                    detail,
                }
            }
            FrameKind::Ping | FrameKind::Pong => {
                if buf.remaining() != 8 {
                    return Err(FrameError::MalformedPayload { kind });
                }
                let token = buf.get_u64();
                if kind == FrameKind::Ping {
                    Frame::Ping { token }
                } else {
                    Frame::Pong { token }
                }
            }
        };

        if frame.stream_id() == crate::CONTROL_STREAM_ID
            && !matches!(frame, Frame::Ping { .. } | Frame::Pong { .. })
        {
            return Err(FrameError::MissingStreamId { kind });
        }

        Ok(frame)
    }
}
