//! Client configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientConfig::default()`]
//! 2. If a JSON file is given and exists, deep-merge its values over defaults
//! 3. Apply `VTS_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Default API port of the host application.
pub const DEFAULT_PORT: u16 = 8001;

/// UDP port host instances announce themselves on.
pub const DISCOVERY_PORT: u16 = 47779;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Identity presented to the host during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginInfo {
    pub name: String,
    pub developer: String,
    /// Base64-encoded 128x128 PNG shown in the consent popup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            name: "Remote Plugin".to_string(),
            developer: "Unknown".to_string(),
            icon: None,
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Give up after this many attempts; retry forever when absent.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Defaults for re-sending a rejected resubscription.
    #[must_use]
    pub const fn resubscribe() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_attempts: Some(3),
        }
    }
}

/// Port discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub port: u16,
    /// Endpoints not announced within this window are forgotten.
    pub stale_after_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            stale_after_ms: 5_000,
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub plugin: PluginInfo,
    /// Pending requests older than this fail with a timeout; `0` disables.
    pub request_timeout_ms: Option<u64>,
    pub reconnect: BackoffConfig,
    pub resubscribe: BackoffConfig,
    pub discovery: DiscoveryConfig,
    /// Where the file token store keeps the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            plugin: PluginInfo::default(),
            request_timeout_ms: Some(30_000),
            reconnect: BackoffConfig::default(),
            resubscribe: BackoffConfig::resubscribe(),
            discovery: DiscoveryConfig::default(),
            token_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file with env var overrides.
    ///
    /// A missing file yields defaults; invalid JSON is an error.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or the result is invalid.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;

        let merged = if path.exists() {
            debug!(?path, "loading client config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        } else {
            debug!(?path, "config file not found, using defaults");
            defaults
        };

        let mut config: Self = serde_json::from_value(merged)?;
        config.request_timeout_ms = config.request_timeout_ms.filter(|ms| *ms > 0);
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with env var overrides applied.
    ///
    /// # Errors
    /// Returns error if the overridden values are invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `VTS_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Unparseable or out-of-range values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = read_string(&lookup, "VTS_HOST") {
            self.host = v;
        }
        if let Some(v) = read_u64(&lookup, "VTS_PORT", 1, u64::from(u16::MAX)) {
            self.port = u16::try_from(v).unwrap_or(self.port);
        }
        if let Some(v) = read_string(&lookup, "VTS_PLUGIN_NAME") {
            self.plugin.name = v;
        }
        if let Some(v) = read_string(&lookup, "VTS_PLUGIN_DEVELOPER") {
            self.plugin.developer = v;
        }
        if let Some(v) = read_u64(&lookup, "VTS_REQUEST_TIMEOUT_MS", 0, 3_600_000) {
            self.request_timeout_ms = (v > 0).then_some(v);
        }
        if let Some(v) = read_u64(&lookup, "VTS_DISCOVERY_PORT", 1, u64::from(u16::MAX)) {
            self.discovery.port = u16::try_from(v).unwrap_or(self.discovery.port);
        }
        if let Some(v) = read_string(&lookup, "VTS_TOKEN_PATH") {
            self.token_path = Some(PathBuf::from(v));
        }
    }

    /// Check the values the host enforces.
    ///
    /// # Errors
    /// Returns error naming the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("plugin.name", &self.plugin.name),
            ("plugin.developer", &self.plugin.developer),
        ] {
            let len = value.chars().count();
            if !(3..=32).contains(&len) {
                return Err(ConfigError::InvalidValue(format!(
                    "{field} must be 3 to 32 characters, got {len}"
                )));
            }
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port must not be 0".into()));
        }
        if self.reconnect.multiplier < 1.0 || self.resubscribe.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "backoff multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Request timeout, or `None` when disabled.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// WebSocket URL of the configured endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
#[must_use]
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    min: u64,
    max: u64,
) -> Option<u64> {
    read_string(lookup, key)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| (min..=max).contains(v))
}
