use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// How the channel retries after losing its transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomized in both directions, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based), with jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::rng().random::<f64>())
    }

    /// Same as [`ReconnectPolicy::delay`] with the random factor supplied;
    /// `random` is expected in `[0.0, 1.0)`.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let exponential = self.base_delay_ms.saturating_mul(1u64 << attempt.min(31));
        let capped = exponential.min(self.max_delay_ms) as f64;
        let factor = 1.0 + (random * 2.0 - 1.0) * self.jitter;
        Duration::from_millis((capped * factor).round().max(0.0) as u64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Client configuration loaded from client.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub server_url: String,
    pub tick_interval_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8001/ws".to_string(),
            tick_interval_ms: 1000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Apply environment overrides on top of the file values.
    pub fn with_overrides(mut self, server_url: Option<String>) -> Self {
        if let Some(url) = server_url.filter(|u| !u.is_empty()) {
            self.server_url = url;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                key: "serverUrl",
                reason: format!("expected a ws:// or wss:// url, got {}", self.server_url),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "tickIntervalMs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid {
                key: "reconnect.jitter",
                reason: format!("must be between 0 and 1, got {}", self.reconnect.jitter),
            });
        }
        Ok(())
    }
}

/// Initialize config directory with defaults if missing.
pub fn init() -> Result<(), ConfigError> {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base).map_err(|source| ConfigError::Io { path: base.clone(), source })?;
    }

    let client_path = config_path("client.json");
    if !client_path.exists() {
        write_defaults(&client_path)?;
    }
    Ok(())
}

fn write_defaults(path: &Path) -> Result<(), ConfigError> {
    let data = serde_json::to_string_pretty(&ClientConfig::default()).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, data).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the client configuration, with `FROST_SERVER_URL` taking precedence.
pub fn load_client_config() -> Result<ClientConfig, ConfigError> {
    let config = load_from(&config_path("client.json"))?
        .with_overrides(std::env::var("FROST_SERVER_URL").ok());
    config.validate()?;
    Ok(config)
}

/// Read a config file. A missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<ClientConfig, ConfigError> {
    if !path.exists() {
        tracing::warn!("{} not found, using defaults", path.display());
        return Ok(ClientConfig::default());
    }

    let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
