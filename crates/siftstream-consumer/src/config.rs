//! Consumer configuration.
//!
//! Loading flow:
//! 1. Start with [`ConsumerConfig::default()`]
//! 2. If a JSON file is given and exists, deep-merge its values over the defaults
//! 3. Apply environment variable overrides (highest priority)

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Interaction timeout used when none is configured (five minutes).
pub const DEFAULT_INTERACTION_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Scheme and host of the stream endpoint.
    pub base_url: String,
    /// Path of the multiplexed stream; query parameters are added per connect.
    pub path: String,
    /// Extra request headers, passed through untouched.
    pub headers: BTreeMap<String, String>,
    /// Recycle the connection after this long without interactions or ticks.
    pub interaction_timeout_ms: u64,
    /// Capacity of the outward event broadcast channel.
    pub event_capacity: usize,
    pub transport: TransportConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://stream.datasift.com".into(),
            path: "/multi".into(),
            headers: BTreeMap::new(),
            interaction_timeout_ms: DEFAULT_INTERACTION_TIMEOUT_MS,
            event_capacity: 1024,
            transport: TransportConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn interaction_timeout(&self) -> Duration {
        Duration::from_millis(self.interaction_timeout_ms)
    }
}

/// Reconnect behaviour of the HTTP transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    /// Consecutive failed connection attempts before giving up.
    pub max_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            max_retries: 10,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Load config from an optional JSON file, then apply env overrides.
pub fn load_config(path: Option<&Path>) -> Result<ConsumerConfig, ConfigError> {
    let defaults = serde_json::to_value(ConsumerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ConsumerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Objects merge per key; everything else is replaced. Nulls in `source` are skipped.
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

/// Invalid or out-of-range values are ignored.
pub fn apply_env_overrides(config: &mut ConsumerConfig) {
    if let Some(v) = read_env_string("SIFTSTREAM_BASE_URL") {
        config.base_url = v;
    }
    if let Some(v) = read_env_u64("SIFTSTREAM_INTERACTION_TIMEOUT_MS", 1_000, 3_600_000) {
        config.interaction_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("SIFTSTREAM_MAX_RETRIES", 0, 1_000) {
        config.transport.max_retries = v as u32;
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    parse_bounded(&raw, min, max)
}

fn parse_bounded(raw: &str, min: u64, max: u64) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|v| (min..=max).contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.path, "/multi");
        assert_eq!(config.interaction_timeout(), Duration::from_secs(300));
        assert_eq!(config.transport.max_retries, 10);
    }

    #[test]
    fn deep_merge_nested() {
        let merged = deep_merge(
            json!({"a": 1, "t": {"x": 1, "y": 2}}),
            json!({"t": {"y": 3}, "b": null}),
        );
        assert_eq!(merged, json!({"a": 1, "t": {"x": 1, "y": 3}}));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.path, ConsumerConfig::default().path);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"path": "/v2/multi", "headers": {{"Authorization": "user:key"}}, "transport": {{"base_delay_ms": 50}}}}"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.path, "/v2/multi");
        assert_eq!(config.headers.get("Authorization").map(String::as_str), Some("user:key"));
        assert_eq!(config.transport.base_delay_ms, 50);
        assert_eq!(config.transport.max_delay_ms, 30_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(load_config(Some(file.path())), Err(ConfigError::Json(_))));
    }

    #[test]
    fn bounded_parsing() {
        assert_eq!(parse_bounded(" 5000 ", 1_000, 10_000), Some(5000));
        assert_eq!(parse_bounded("10", 1_000, 10_000), None);
        assert_eq!(parse_bounded("abc", 0, 10), None);
    }
}
