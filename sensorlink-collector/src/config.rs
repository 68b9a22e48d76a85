use crate::registry::LivenessPolicy;
use sensorlink_protocol::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CollectorConfig {
    pub listen: String,
    pub http_listen: Option<String>, // API snapshot désactivée si absent
    pub max_history: usize,
    pub max_frame_bytes: usize,
    pub handshake_timeout_ms: u64,
    pub event_buffer: usize,
    pub liveness: LivenessConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LivenessConf {
    pub sweep_interval_ms: u64,
    pub grace_ms: u64,
    pub max_missed: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9000".into(),
            http_listen: None,
            max_history: 100,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            handshake_timeout_ms: 10_000,
            event_buffer: 256,
            liveness: LivenessConf::default(),
        }
    }
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 3_000,
            grace_ms: 4_000,
            max_missed: 3,
        }
    }
}

impl LivenessConf {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn policy(&self) -> LivenessPolicy {
        LivenessPolicy {
            grace: Duration::from_millis(self.grace_ms),
            max_missed: self.max_missed,
        }
    }
}

impl CollectorConfig {
    pub fn from_yaml(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_history", self.max_history as u64),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("event_buffer", self.event_buffer as u64),
            ("liveness.sweep_interval_ms", self.liveness.sweep_interval_ms),
            ("liveness.max_missed", self.liveness.max_missed as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "listen",
                reason: "empty address".into(),
            });
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Charge la config depuis SENSORLINK_COLLECTOR_CONFIG (défaut collector.yaml).
/// Une config absente ou invalide retombe sur les valeurs par défaut.
pub async fn load_config() -> CollectorConfig {
    let path = std::env::var("SENSORLINK_COLLECTOR_CONFIG").unwrap_or_else(|_| "collector.yaml".into());
    let mut cfg = load_config_from(&path).await;
    if let Ok(listen) = std::env::var("SENSORLINK_LISTEN") {
        cfg.listen = listen;
    }
    cfg
}

pub async fn load_config_from(path: impl AsRef<Path>) -> CollectorConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!("no {} found, using default config", path.display());
        return CollectorConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    CollectorConfig::from_yaml(&txt).unwrap_or_else(|e| {
        warn!("invalid config {}: {e}", path.display());
        CollectorConfig::default()
    })
}
