//! SensorLink node
//!
//! Telemetry producer side of the protocol:
//! - Session with the collector (handshake, heartbeats, readings)
//! - Simulated sensor
//! - TOML configuration

pub mod config;
pub mod sensor;
pub mod session;

pub use config::{NodeConfig, SessionSettings};
pub use sensor::{SensorSimulator, SensorSource};
pub use session::{ClientSession, SessionConfig, SessionError, SessionEvent, SessionState};
