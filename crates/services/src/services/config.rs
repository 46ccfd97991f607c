use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CURRENT_CONFIG_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8686
}

fn default_inference_base_url() -> String {
    "http://127.0.0.1:9090".to_string()
}

fn default_edit_max_attempts() -> u32 {
    2
}

fn default_regenerate_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    1
}

fn default_retry_max_delay_secs() -> u64 {
    10
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_token_ttl_secs() -> i64 {
    3600
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Absolute base prepended to stored-object URLs. Relative `/files/...`
    /// URLs are returned when unset.
    pub public_base_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_inference_base_url(),
            api_key: None,
        }
    }
}

/// Retry and deadline knobs for transformation runs. Attempt counts are
/// totals, first try included.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub edit_max_attempts: u32,
    pub regenerate_max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub task_timeout_secs: u64,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            edit_max_attempts: default_edit_max_attempts(),
            regenerate_max_attempts: default_regenerate_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Generated and persisted on first boot when missing.
    pub secret: Option<String>,
    pub ttl_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_secs: default_token_ttl_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub config_version: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub inference: InferenceConfig,
    pub transform: TransformConfig,
    pub token: TokenConfig,
}

impl Config {
    pub fn from_raw(raw_config: &str) -> Self {
        match serde_json::from_str::<Config>(raw_config) {
            Ok(config) => config.normalized(),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config (line {}, column {}): {}, using default",
                    e.line(),
                    e.column(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        self.config_version = CURRENT_CONFIG_VERSION.to_string();

        if self.transform.edit_max_attempts == 0 {
            tracing::warn!("edit_max_attempts set to 0, using 1");
            self.transform.edit_max_attempts = 1;
        }
        if self.transform.regenerate_max_attempts == 0 {
            tracing::warn!("regenerate_max_attempts set to 0, using 1");
            self.transform.regenerate_max_attempts = 1;
        }
        if self.transform.task_timeout_secs == 0 {
            tracing::warn!("task_timeout_secs set to 0, using default");
            self.transform.task_timeout_secs = default_task_timeout_secs();
        }

        self
    }
}

/// Will always return config, falling back to defaults on missing/invalid files.
pub async fn load_config_from_file(config_path: &PathBuf) -> Config {
    match std::fs::read_to_string(config_path) {
        Ok(raw_config) => Config::from_raw(&raw_config),
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                tracing::info!("No config file found, creating one");
            } else {
                tracing::warn!("Failed to read config file: {}", err);
            }
            Config::default()
        }
    }
}

/// Saves the config to the given path
pub async fn save_config_to_file(
    config: &Config,
    config_path: &PathBuf,
) -> Result<(), ConfigError> {
    let normalized = config.clone().normalized();
    let raw_config = serde_json::to_string_pretty(&normalized)?;
    std::fs::write(config_path, raw_config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_raw_falls_back_to_defaults() {
        let config = Config::from_raw("{not json");
        assert_eq!(config.transform.edit_max_attempts, 2);
        assert_eq!(config.transform.regenerate_max_attempts, 3);
        assert_eq!(config.server.port, 8686);
    }

    #[test]
    fn partial_raw_keeps_remaining_defaults() {
        let config = Config::from_raw(r#"{"transform": {"edit_max_attempts": 5}}"#);
        assert_eq!(config.transform.edit_max_attempts, 5);
        assert_eq!(config.transform.regenerate_max_attempts, 3);
        assert_eq!(config.transform.task_timeout_secs, 300);
    }

    #[test]
    fn normalized_clamps_zero_attempts() {
        let mut config = Config::default();
        config.transform.edit_max_attempts = 0;
        config.transform.task_timeout_secs = 0;

        let normalized = config.normalized();
        assert_eq!(normalized.transform.edit_max_attempts, 1);
        assert_eq!(normalized.transform.task_timeout_secs, 300);
        assert_eq!(normalized.config_version, CURRENT_CONFIG_VERSION);
    }
}
