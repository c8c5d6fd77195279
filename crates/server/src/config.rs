//! Server configuration
//!
//! Loaded from an optional JSON file; every field has a default so a partial
//! (or missing) file is fine. CLI flags are applied on top by the binary.

use std::path::Path;
use std::time::Duration;

use inference::constants::{hosts, limits, ports, timeouts};
use inference::BridgeConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Default upstream: a local Ollama daemon
pub const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MODEL: &str = "gemma3n:e2b";

/// Generation bridge timing, in config-file units
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeSettings {
    pub ready_timeout_secs: u64,
    pub ready_poll_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            ready_timeout_secs: timeouts::SESSION_READY_SECS,
            ready_poll_ms: timeouts::SESSION_READY_POLL_MS,
        }
    }
}

/// Full server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind (`0.0.0.0` for all)
    pub host: String,
    /// Listen port; `0` picks a free one
    pub port: u16,
    /// Model name passed to the upstream
    pub model: String,
    /// Base URL of the OpenAI-compatible upstream
    pub upstream_url: String,
    pub bridge: BridgeSettings,
    pub stream_queue_capacity: usize,
    pub stream_chunk_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: hosts::ANY.to_string(),
            port: ports::SERVER,
            model: DEFAULT_MODEL.to_string(),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            bridge: BridgeSettings::default(),
            stream_queue_capacity: limits::STREAM_QUEUE_CAPACITY,
            stream_chunk_timeout_secs: timeouts::STREAM_CHUNK_SECS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !fs::try_exists(path).await.map_err(ConfigError::Io)? {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await.map_err(ConfigError::Io)?;
        let config: Self = serde_json::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;

        log::info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stream_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.bridge.ready_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "bridge.ready_poll_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            ready_timeout: Duration::from_secs(self.bridge.ready_timeout_secs),
            ready_poll_interval: Duration::from_millis(self.bridge.ready_poll_ms),
            ..BridgeConfig::default()
        }
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_chunk_timeout_secs)
    }

    /// `host:port` for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
