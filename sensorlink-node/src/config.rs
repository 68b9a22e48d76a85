//! Node configuration
//!
//! Stored as TOML in the OS config directory:
//! - Collector address and requested identity
//! - Emitter intervals and connection timeouts
//!
//! `SENSORLINK_SERVER` and `SENSORLINK_IDENTITY` override the file.

use crate::session::SessionConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server: String,
    /// Empty: the collector assigns one
    pub identity: String,
    pub auto_connect: bool,
    pub session: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub heartbeat_interval_ms: u64,
    pub data_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9000".to_string(),
            identity: String::new(),
            auto_connect: true,
            session: SessionSettings::default(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 3_000,
            data_interval_ms: 1_000,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            data_interval: Duration::from_millis(self.data_interval_ms.max(1)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

impl NodeConfig {
    /// Load config from the OS-specific location, then apply env overrides
    pub async fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_file_path()?).await?;
        config.apply_env();
        Ok(config)
    }

    /// Missing file means first run: defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&content)?)
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, toml::to_string_pretty(self)?).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("sensorlink-node");
        path.push("config.toml");
        Ok(path)
    }

    fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var("SENSORLINK_SERVER").ok(),
            std::env::var("SENSORLINK_IDENTITY").ok(),
        );
    }

    fn apply_overrides(&mut self, server: Option<String>, identity: Option<String>) {
        if let Some(server) = server.filter(|s| !s.trim().is_empty()) {
            self.server = server;
        }
        if let Some(identity) = identity {
            self.identity = identity.trim().to_string();
        }
    }
}
