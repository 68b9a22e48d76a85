//! SensorLink wire protocol
//!
//! Shared by the collector and the nodes:
//! - Typed messages (connect, disconnect, heartbeat, data, connect_response)
//! - Self-delimiting frames: one compact JSON object per line
//! - Async frame reader/writer over any byte stream

pub mod codec;
pub mod message;

pub use codec::{decode, encode, FrameBuffer, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES};
pub use message::{unix_now, ConnectResult, Message, MessageBody, MessageKind, Reading};

/// Errors raised while encoding, decoding or moving frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid reading: {0}")]
    InvalidReading(String),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame(reason.into())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedFrame(_))
    }
}
