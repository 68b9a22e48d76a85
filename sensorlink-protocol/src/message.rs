//! Protocol messages (matches the connect/disconnect/heartbeat/data/connect_response frames)

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Frame discriminant as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Connect,
    Disconnect,
    Heartbeat,
    Data,
    ConnectResponse,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Connect => "connect",
            MessageKind::Disconnect => "disconnect",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Data => "data",
            MessageKind::ConnectResponse => "connect_response",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sensor reading (one decimal digit by convention)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
}

impl Reading {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self { temperature, humidity }
    }

    pub fn is_finite(&self) -> bool {
        self.temperature.is_finite() && self.humidity.is_finite()
    }
}

/// Payload of a connect_response frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Connect,
    Disconnect,
    Heartbeat,
    Data(Reading),
    ConnectResponse(ConnectResult),
}

/// A decoded protocol message.
///
/// `identity` is empty only on a Connect that asks the collector to assign
/// one. On a successful ConnectResponse it carries the identity the session
/// is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub identity: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    pub body: MessageBody,
}

impl Message {
    pub fn new(identity: impl Into<String>, body: MessageBody) -> Self {
        Self {
            identity: identity.into(),
            timestamp: unix_now(),
            body,
        }
    }

    pub fn connect(identity: impl Into<String>) -> Self {
        Self::new(identity, MessageBody::Connect)
    }

    pub fn disconnect(identity: impl Into<String>) -> Self {
        Self::new(identity, MessageBody::Disconnect)
    }

    pub fn heartbeat(identity: impl Into<String>) -> Self {
        Self::new(identity, MessageBody::Heartbeat)
    }

    pub fn data(identity: impl Into<String>, reading: Reading) -> Self {
        Self::new(identity, MessageBody::Data(reading))
    }

    pub fn connect_response(identity: impl Into<String>, success: bool, message: impl Into<String>) -> Self {
        Self::new(
            identity,
            MessageBody::ConnectResponse(ConnectResult {
                success,
                message: message.into(),
            }),
        )
    }

    /// Overrides the timestamp (tests, replays)
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            MessageBody::Connect => MessageKind::Connect,
            MessageBody::Disconnect => MessageKind::Disconnect,
            MessageBody::Heartbeat => MessageKind::Heartbeat,
            MessageBody::Data(_) => MessageKind::Data,
            MessageBody::ConnectResponse(_) => MessageKind::ConnectResponse,
        }
    }
}

/// Current wall-clock time as integer seconds since the Unix epoch
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
