use sensorlink_protocol::Reading;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Online,
    Offline,
}

/// Why an identity changed status (rendered in status records)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReason {
    #[serde(rename = "first connect")]
    FirstConnect,
    #[serde(rename = "reconnect after offline")]
    Reconnected,
    #[serde(rename = "replaced prior connection")]
    ReplacedConnection,
    #[serde(rename = "reconnected via heartbeat")]
    HeartbeatRecovered,
    #[serde(rename = "graceful disconnect")]
    GracefulDisconnect,
    #[serde(rename = "connection lost")]
    ConnectionLost,
    #[serde(rename = "timeout")]
    Timeout,
}

impl StatusReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusReason::FirstConnect => "first connect",
            StatusReason::Reconnected => "reconnect after offline",
            StatusReason::ReplacedConnection => "replaced prior connection",
            StatusReason::HeartbeatRecovered => "reconnected via heartbeat",
            StatusReason::GracefulDisconnect => "graceful disconnect",
            StatusReason::ConnectionLost => "connection lost",
            StatusReason::Timeout => "timeout",
        }
    }

    /// Status an identity ends up in after a transition with this reason
    pub fn status(&self) -> ClientStatus {
        match self {
            StatusReason::FirstConnect
            | StatusReason::Reconnected
            | StatusReason::ReplacedConnection
            | StatusReason::HeartbeatRecovered => ClientStatus::Online,
            StatusReason::GracefulDisconnect | StatusReason::ConnectionLost | StatusReason::Timeout => {
                ClientStatus::Offline
            }
        }
    }
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub identity: String,
    pub status: ClientStatus,
    pub reason: StatusReason,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingEvent {
    pub identity: String,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: i64,
}

/// Events pushed to presentation collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CollectorEvent {
    Status(StatusEvent),
    Reading(ReadingEvent),
}

/// Read-only view of one client record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientView {
    pub identity: String,
    pub status: ClientStatus,
    pub last_seen: i64,           // epoch seconds
    pub silent_for_seconds: u64,  // depuis le dernier contact
    pub missed_heartbeats: u32,
    pub last_reading: Option<Reading>,
    pub first_seen: i64,
    pub sessions: u32,
}
