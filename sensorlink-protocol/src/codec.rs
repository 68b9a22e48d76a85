//! Frame codec: newline-delimited compact JSON
//!
//! JSON string escaping never emits a raw `\n`, so a frame boundary can not
//! depend on payload content. Partial reads are buffered in [`FrameBuffer`]
//! until a full line is available.

use crate::message::{ConnectResult, Message, MessageBody, MessageKind, Reading};
use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Upper bound for one frame, newline excluded
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

const READ_CHUNK_BYTES: usize = 4096;

/// On-wire record: `{kind, identity, timestamp, payload?}`
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    kind: MessageKind,
    #[serde(default)]
    identity: String,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

/// Encodes one message into a complete frame (trailing `\n` included)
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = match &msg.body {
        MessageBody::Connect | MessageBody::Disconnect | MessageBody::Heartbeat => None,
        MessageBody::Data(reading) => {
            if !reading.is_finite() {
                return Err(ProtocolError::InvalidReading(format!(
                    "non-finite values (temperature={}, humidity={})",
                    reading.temperature, reading.humidity
                )));
            }
            Some(to_value(reading)?)
        }
        MessageBody::ConnectResponse(result) => Some(to_value(result)?),
    };

    let frame = WireFrame {
        kind: msg.kind(),
        identity: msg.identity.clone(),
        timestamp: msg.timestamp,
        payload,
    };

    let mut bytes = serde_json::to_vec(&frame)
        .map_err(|e| ProtocolError::malformed(format!("serialization failed: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes one frame; the trailing newline is optional
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let line = trim_line_ending(bytes);
    if line.is_empty() {
        return Err(ProtocolError::malformed("empty frame"));
    }

    let frame: WireFrame = serde_json::from_slice(line)
        .map_err(|e| ProtocolError::malformed(e.to_string()))?;

    let body = match (frame.kind, frame.payload) {
        (MessageKind::Connect, None) => MessageBody::Connect,
        (MessageKind::Disconnect, None) => MessageBody::Disconnect,
        (MessageKind::Heartbeat, None) => MessageBody::Heartbeat,
        (MessageKind::Data, Some(payload)) => MessageBody::Data(from_value::<Reading>(payload, "data")?),
        (MessageKind::ConnectResponse, Some(payload)) => {
            MessageBody::ConnectResponse(from_value::<ConnectResult>(payload, "connect_response")?)
        }
        (kind @ (MessageKind::Data | MessageKind::ConnectResponse), None) => {
            return Err(ProtocolError::malformed(format!("{kind} frame without payload")));
        }
        (kind, Some(_)) => {
            return Err(ProtocolError::malformed(format!("unexpected payload on {kind} frame")));
        }
    };

    Ok(Message {
        identity: frame.identity,
        timestamp: frame.timestamp,
        body,
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::malformed(format!("serialization failed: {e}")))
}

fn from_value<T: serde::de::DeserializeOwned>(value: serde_json::Value, kind: &str) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::malformed(format!("invalid {kind} payload: {e}")))
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

/// Accumulates raw bytes and yields complete frames
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    ///
    /// Blank lines are skipped. A line longer than `max_frame_bytes` (or an
    /// unterminated run of bytes past that size) is reported as malformed.
    pub fn next_frame(&mut self) -> Option<Result<Message, ProtocolError>> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > self.max_frame_bytes {
                    let len = self.buf.len();
                    self.buf.clear();
                    return Some(Err(self.oversize(len)));
                }
                return None;
            };

            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let content = trim_line_ending(&line);
            if content.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if content.len() > self.max_frame_bytes {
                return Some(Err(self.oversize(content.len())));
            }
            return Some(decode(content));
        }
    }

    /// True when bytes of an unfinished frame are pending
    pub fn has_partial(&self) -> bool {
        !self.buf.iter().all(u8::is_ascii_whitespace)
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    fn oversize(&self, len: usize) -> ProtocolError {
        ProtocolError::malformed(format!(
            "frame of {len} bytes exceeds limit of {} bytes",
            self.max_frame_bytes
        ))
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

/// Reads messages from a byte stream
pub struct FrameReader<R> {
    inner: R,
    frames: FrameBuffer,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame(inner, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            frames: FrameBuffer::new(max_frame_bytes),
            chunk: vec![0; READ_CHUNK_BYTES],
        }
    }

    /// Next message, `Ok(None)` on a clean end of stream.
    ///
    /// Cancellation safe: bytes read before a cancelled call stay buffered.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            if let Some(frame) = self.frames.next_frame() {
                return frame.map(Some);
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.frames.has_partial() {
                    return Err(ProtocolError::malformed(format!(
                        "stream closed inside a frame ({} bytes pending)",
                        self.frames.pending_bytes()
                    )));
                }
                return Ok(None);
            }
            trace!(bytes = n, "frame reader received bytes");
            self.frames.extend(&self.chunk[..n]);
        }
    }
}

/// Writes messages to a byte stream, one whole frame per call
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        let frame = encode(msg)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Closes the write direction of the transport
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
