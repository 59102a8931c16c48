//! Node configuration.
//!
//! # Load Order
//!
//! 1. Default values
//! 2. TOML file (optional, [`ConfigLoader::with_file`])
//! 3. Environment variables (`SERVICE_*`)
//!
//! Each layer overrides the previous. Missing files are ignored.

use crate::store::adapter::ReconnectPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for environment variable '{name}': {message}")]
    InvalidEnvVar { name: String, message: String },
}

impl ConfigError {
    pub fn invalid_env_var(name: &str, message: impl Into<String>) -> Self {
        Self::InvalidEnvVar {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Source of environment overrides. Production passes `std::env::var`.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Implemented by every config root the loader can produce.
pub trait ApplyEnv {
    fn apply_env(&mut self, env: EnvLookup<'_>) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Origin node identifier reported in validation failures.
    pub node_id: String,
    /// Default per-call timeout; `0` disables it.
    pub request_timeout_ms: u64,
    pub cache: CacheConfig,
    pub channels: ChannelConfig,
    pub store: StoreConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::new_v4()),
            request_timeout_ms: 0,
            cache: CacheConfig::default(),
            channels: ChannelConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

impl ApplyEnv for BrokerConfig {
    fn apply_env(&mut self, env: EnvLookup<'_>) -> Result<(), ConfigError> {
        if let Some(val) = env("SERVICE_NODE_ID") {
            self.node_id = val;
        }
        if let Some(val) = env("SERVICE_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = val
                .parse()
                .map_err(|_| {
                    ConfigError::invalid_env_var("SERVICE_REQUEST_TIMEOUT_MS", "expected milliseconds")
                })?;
        }
        if let Some(val) = env("SERVICE_CACHE_ENABLED") {
            self.cache.enabled = parse_bool(&val).ok_or_else(|| {
                ConfigError::invalid_env_var("SERVICE_CACHE_ENABLED", "expected bool")
            })?;
        }
        if let Some(val) = env("SERVICE_CHANNEL_MAX_RETRIES") {
            self.channels.max_retries = val
                .parse()
                .map_err(|_| {
                    ConfigError::invalid_env_var("SERVICE_CHANNEL_MAX_RETRIES", "expected integer")
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Fingerprints making a key longer than this are hashed.
    pub max_key_length: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_key_length: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Redeliveries after the first attempt.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_in_flight: usize,
    pub buffer: usize,
    pub dead_letter_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 100,
            max_in_flight: 16,
            buffer: 256,
            dead_letter_capacity: 1000,
        }
    }
}

impl ChannelConfig {
    /// Delay before redelivery `attempt` (1-based), doubling each time.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `None` retries forever.
    pub reconnect_attempts: Option<u32>,
    pub reconnect_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: None,
            reconnect_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl StoreConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            backoff: Duration::from_millis(self.reconnect_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Configuration loader with builder pattern.
///
/// ```ignore
/// let config: BrokerConfig = ConfigLoader::new()
///     .with_file("service.toml")
///     .skip_env()
///     .load()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skips environment variable loading.
    #[must_use]
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn load<T>(&self) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default + ApplyEnv,
    {
        self.load_with_env(&|name: &str| std::env::var(name).ok())
    }

    /// Like [`ConfigLoader::load`] but reads overrides from `env`.
    pub fn load_with_env<T>(&self, env: EnvLookup<'_>) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default + ApplyEnv,
    {
        let mut config = match &self.file {
            Some(path) => match load_file(path)? {
                Some(config) => {
                    debug!(path = %path.display(), "Loaded config file");
                    config
                }
                None => T::default(),
            },
            None => T::default(),
        };

        if !self.skip_env {
            config.apply_env(env)?;
        }
        Ok(config)
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&content).map_err(|source| ConfigError::ParseToml {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(config))
}

/// Accepts: "true", "false", "1", "0", "yes", "no", "on", "off" (case-insensitive).
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config: BrokerConfig = ConfigLoader::new().skip_env().load().unwrap();
        assert!(config.node_id.starts_with("node-"));
        assert_eq!(config.request_timeout(), None);
        assert!(config.cache.enabled);
        assert_eq!(config.channels.max_retries, 3);
        assert_eq!(config.store.reconnect_policy().max_attempts, None);
    }

    #[test]
    fn test_file_then_env_layering() {
        let path = std::env::temp_dir().join(format!("service-config-{}.toml", Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
node_id = "from-file"
request_timeout_ms = 250

[channels]
max_retries = 1
"#,
        )
        .unwrap();

        let env = env_of(&[("SERVICE_NODE_ID", "from-env"), ("SERVICE_CACHE_ENABLED", "off")]);
        let config: BrokerConfig = ConfigLoader::new().with_file(&path).load_with_env(&env).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.node_id, "from-env");
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.channels.max_retries, 1);
        assert_eq!(config.channels.buffer, 256);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config: BrokerConfig = ConfigLoader::new()
            .with_file("/nonexistent/service.toml")
            .skip_env()
            .load()
            .unwrap();
        assert_eq!(config.channels.max_in_flight, 16);
    }

    #[test]
    fn test_invalid_env_value() {
        let env = env_of(&[("SERVICE_CHANNEL_MAX_RETRIES", "many")]);
        let err = ConfigLoader::new()
            .load_with_env::<BrokerConfig>(&env)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { .. }));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let channels = ChannelConfig {
            retry_backoff_ms: 10,
            ..Default::default()
        };
        assert_eq!(channels.retry_delay(1), Duration::from_millis(10));
        assert_eq!(channels.retry_delay(3), Duration::from_millis(40));
    }
}
