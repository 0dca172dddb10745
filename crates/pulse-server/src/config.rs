//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a JSON config file is given, deep-merge its values over the defaults
//! 3. Apply `PULSE_*` environment variable overrides
//!
//! CLI flags are applied by the binary on top of the result.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatcher::FanOut;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Configuration for the pulse server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `8001`, `0` for auto-assign).
    pub port: u16,
    /// Frames buffered per subscriber before writes start waiting.
    pub send_queue_capacity: usize,
    /// How long a write may wait for queue space before the subscriber is dropped.
    pub write_timeout_ms: u64,
    /// Upper bound on subscribers per channel. `None` is unbounded.
    pub max_connections_per_channel: Option<usize>,
    pub fan_out: FanOut,
    /// Channels empty for this long are evicted.
    pub channel_idle_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8001,
            send_queue_capacity: 256,
            write_timeout_ms: 5000,
            max_connections_per_channel: None,
            fan_out: FanOut::Sequential,
            channel_idle_timeout_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

/// Per-channel settings derived from [`ServerConfig`].
#[derive(Clone, Debug)]
pub struct ChannelSettings {
    pub send_queue_capacity: usize,
    pub write_timeout: Duration,
    pub max_connections: Option<usize>,
    pub fan_out: FanOut,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ServerConfig::default().channel_settings()
    }
}

impl ServerConfig {
    /// Load defaults, an optional JSON file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Deep-merge a JSON file over the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(?path, "loading config file");
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;
        let user: Value = serde_json::from_str(content)?;
        Ok(serde_json::from_value(deep_merge(defaults, user))?)
    }

    /// Apply `PULSE_*` overrides, reading each variable through `lookup`.
    /// Empty values are ignored.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = read("PULSE_HOST") {
            self.host = v;
        }
        if let Some(v) = read("PULSE_PORT") {
            self.port = parse_value("PULSE_PORT", &v)?;
        }
        if let Some(v) = read("PULSE_SEND_QUEUE") {
            self.send_queue_capacity = parse_value("PULSE_SEND_QUEUE", &v)?;
        }
        if let Some(v) = read("PULSE_WRITE_TIMEOUT_MS") {
            self.write_timeout_ms = parse_value("PULSE_WRITE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = read("PULSE_MAX_CONNECTIONS") {
            self.max_connections_per_channel = Some(parse_value("PULSE_MAX_CONNECTIONS", &v)?);
        }
        if let Some(v) = read("PULSE_FAN_OUT") {
            self.fan_out = v
                .parse()
                .map_err(|e: String| ConfigError::invalid("PULSE_FAN_OUT", e))?;
        }
        if let Some(v) = read("PULSE_CHANNEL_IDLE_SECS") {
            self.channel_idle_timeout_secs = parse_value("PULSE_CHANNEL_IDLE_SECS", &v)?;
        }
        if let Some(v) = read("PULSE_CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval_secs = parse_value("PULSE_CLEANUP_INTERVAL_SECS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("host", "must not be empty"));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::invalid("send_queue_capacity", "must be at least 1"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::invalid("write_timeout_ms", "must be at least 1"));
        }
        if self.max_connections_per_channel == Some(0) {
            return Err(ConfigError::invalid(
                "max_connections_per_channel",
                "must be at least 1",
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::invalid("cleanup_interval_secs", "must be at least 1"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn channel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            send_queue_capacity: self.send_queue_capacity,
            write_timeout: self.write_timeout(),
            max_connections: self.max_connections_per_channel,
            fan_out: self.fan_out,
        }
    }
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key; arrays and primitives are replaced. Null values in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("{raw:?}: {e}")))
}
