//! Engine configuration.
//!
//! Configuration is read once, when a [`Runtime`](crate::Runtime) is built,
//! and is immutable afterwards. It can come from code, JSON text, a JSON
//! file, and environment overrides, in that order of precedence (later
//! sources win).
//!
//! ```json
//! {
//!   "num_threads": 8,
//!   "metrics": true,
//!   "batch": { "search_batch_size": 5000, "pin_threshold": 64 }
//! }
//! ```

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::error::{Error, Result};

/// Environment variable overriding [`EngineConfig::num_threads`].
pub const ENV_NUM_THREADS: &str = "VECGATE_NUM_THREADS";
/// Environment variable overriding [`EngineConfig::metrics`].
pub const ENV_METRICS: &str = "VECGATE_METRICS";

/// Runtime-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Native worker thread count. `None` leaves the engine default.
    pub num_threads: Option<usize>,
    /// Enables process-wide metrics when the runtime is built.
    pub metrics: bool,
    pub batch: BatchConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_threads(mut self, threads: usize) -> Self {
        self.num_threads = Some(threads);
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Reads a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Applies `VECGATE_NUM_THREADS` and `VECGATE_METRICS` if set.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup(ENV_NUM_THREADS) {
            let threads = value.trim().parse::<usize>().map_err(|_| {
                Error::InvalidConfig(format!("{} must be an integer, got '{}'", ENV_NUM_THREADS, value))
            })?;
            self.num_threads = Some(threads);
        }
        if let Some(value) = lookup(ENV_METRICS) {
            self.metrics = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" | "" => false,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_METRICS, other
                    )))
                }
            };
        }
        Ok(self)
    }

    /// Checks every field.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == Some(0) {
            return Err(Error::InvalidConfig(
                "num_threads must be positive".to_string(),
            ));
        }
        self.batch.validate()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_json() {
        let config =
            EngineConfig::from_json(r#"{"num_threads": 4, "batch": {"pin_threshold": 8}}"#)
                .unwrap();
        assert_eq!(config.num_threads, Some(4));
        assert!(!config.metrics);
        assert_eq!(config.batch.pin_threshold, 8);
        assert_eq!(config.batch.search_batch_size, 10_000);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = EngineConfig::new()
            .with_num_threads(2)
            .with_metrics(true)
            .with_batch(BatchConfig::default().with_add_batch_size(50));
        let text = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            EngineConfig::from_json("{\"num_threads\": \"many\"}"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> =
            [(ENV_NUM_THREADS, "3"), (ENV_METRICS, "true")].into_iter().collect();
        let config = EngineConfig::new()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.num_threads, Some(3));
        assert!(config.metrics);

        let bad = EngineConfig::new()
            .with_overrides(|k| (k == ENV_METRICS).then(|| "maybe".to_string()));
        assert!(matches!(bad, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate() {
        assert!(EngineConfig::default().validate().is_ok());
        let config = EngineConfig {
            num_threads: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_missing_file() {
        let path = std::env::temp_dir().join("vecgate_missing_config.json");
        assert!(matches!(EngineConfig::from_file(path), Err(Error::Io(_))));
    }
}
