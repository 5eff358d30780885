//! Engine configuration.
//!
//! Settings come from [`EngineConfig::default`], a JSON file or `ROWFLOW_*`
//! environment variables (the CLI loads a `.env` file first).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Default number of left rows per deferred batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default idle time before a partial batch is flushed.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1000;

/// Default entry limit of the deferred result cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// Default number of rows per writer flush.
pub const DEFAULT_WRITER_BATCH_SIZE: usize = 500;

/// Tunables shared by every stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Left rows accumulated before a deferred batch is resolved.
    pub batch_size: usize,

    /// Milliseconds without a new row before a partial batch is flushed.
    pub idle_timeout_ms: u64,

    /// Keys kept by the deferred result cache before it is reset.
    pub cache_capacity: usize,

    /// Rows per batched writer flush.
    pub writer_batch_size: usize,

    /// Flag every created row for column-change tracing.
    pub trace_rows: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            writer_batch_size: DEFAULT_WRITER_BATCH_SIZE,
            trace_rows: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Defaults overridden by `ROWFLOW_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `ROWFLOW_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "ROWFLOW_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "ROWFLOW_IDLE_TIMEOUT_MS")? {
            config.idle_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "ROWFLOW_CACHE_CAPACITY")? {
            config.cache_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "ROWFLOW_WRITER_BATCH_SIZE")? {
            config.writer_batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "ROWFLOW_TRACE_ROWS")? {
            config.trace_rows = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("cache_capacity", self.cache_capacity),
            ("writer_batch_size", self.writer_batch_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> ConfigResult<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.cache_capacity, 100_000);
        assert!(!config.trace_rows);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "batch_size": 3 }"#).unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "batch_size": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ROWFLOW_BATCH_SIZE", "25"),
            ("ROWFLOW_TRACE_ROWS", "true"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.batch_size, 25);
        assert!(config.trace_rows);
        assert_eq!(config.writer_batch_size, DEFAULT_WRITER_BATCH_SIZE);
    }

    #[test]
    fn test_lookup_rejects_garbage() {
        let err = EngineConfig::from_lookup(|k| {
            (k == "ROWFLOW_IDLE_TIMEOUT_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "ROWFLOW_IDLE_TIMEOUT_MS", .. }));
    }

    #[test]
    fn test_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rowflow.json");
        std::fs::write(&path, r#"{ "idle_timeout_ms": 50 }"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_millis(50));
    }
}
