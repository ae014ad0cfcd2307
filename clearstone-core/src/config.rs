//! Configuration types for Clearstone

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ClearstoneError, Result};

/// Main configuration for Clearstone
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClearstoneConfig {
    /// Tracing provider configuration
    #[serde(default)]
    pub tracing: TracingConfig,

    /// Checkpoint configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Configuration accepted by the tracing provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// SQLite database file for persisted spans
    pub storage_path: PathBuf,

    /// Service name stamped on every span
    pub service_name: String,

    /// Number of buffered spans that triggers a flush
    pub batch_size: usize,

    /// Maximum time a span waits in the buffer before being flushed
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Total write attempts per batch before it is dropped
    pub flush_max_attempts: usize,

    /// Delay before the first flush retry (doubles on each retry)
    #[serde(with = "humantime_serde")]
    pub flush_retry_delay: Duration,

    /// Largest encoded input/output snapshot recorded on a span
    pub max_snapshot_bytes: usize,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("clearstone_traces.db"),
            service_name: "clearstone".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            flush_max_attempts: 3,
            flush_retry_delay: Duration::from_millis(100),
            max_snapshot_bytes: 1024 * 1024,
        }
    }
}

impl TracingConfig {
    /// Builder: set the storage path
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Builder: set the service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Builder: set the batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder: set the flush interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ClearstoneError::Configuration(
                "tracing.batch_size must be at least 1".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ClearstoneError::Configuration(
                "tracing.flush_interval must be greater than zero".to_string(),
            ));
        }
        if self.service_name.trim().is_empty() {
            return Err(ClearstoneError::Configuration(
                "tracing.service_name must not be empty".to_string(),
            ));
        }
        if self.flush_max_attempts == 0 {
            return Err(ClearstoneError::Configuration(
                "tracing.flush_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Checkpoint storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for checkpoints saved without an explicit path
    pub checkpoint_dir: PathBuf,

    /// Largest encoded agent state accepted by `save_checkpoint`
    pub max_state_bytes: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(".clearstone_checkpoints"),
            max_state_bytes: 16 * 1024 * 1024,
        }
    }
}

impl CheckpointConfig {
    /// Builder: set the checkpoint directory
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    /// Builder: set the state size limit
    pub fn with_max_state_bytes(mut self, limit: usize) -> Self {
        self.max_state_bytes = limit;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_state_bytes == 0 {
            return Err(ClearstoneError::Configuration(
                "checkpoint.max_state_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ClearstoneConfig {
    /// Load configuration from `clearstone.toml` and `CLEARSTONE_` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `CLEARSTONE_TRACING__BATCH_SIZE=50`.
    /// A file named by `CLEARSTONE_CONFIG_PATH` is merged last.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Toml},
        };

        let mut figment = Figment::new()
            .merge(Toml::file("clearstone.toml"))
            .merge(
                Env::prefixed("CLEARSTONE_")
                    .ignore(&["CONFIG_PATH"])
                    .split("__"),
            );

        if let Ok(path) = std::env::var("CLEARSTONE_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: ClearstoneConfig = figment.extract().map_err(|e| {
            ClearstoneError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        let config: ClearstoneConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                ClearstoneError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.tracing.validate()?;
        self.checkpoint.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClearstoneConfig::default();
        assert_eq!(config.tracing.batch_size, 100);
        assert_eq!(config.tracing.flush_interval, Duration::from_secs(5));
        assert_eq!(config.tracing.service_name, "clearstone");
        assert_eq!(config.checkpoint.max_state_bytes, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let mut config = ClearstoneConfig::default();
        config.tracing.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ClearstoneError::Configuration(_)));
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut config = ClearstoneConfig::default();
        config.tracing.flush_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "clearstone.toml",
                r#"
                [tracing]
                storage_path = "traces/agent.db"
                service_name = "support-bot"
                flush_interval = "250ms"

                [checkpoint]
                checkpoint_dir = "ckpts"
                "#,
            )?;
            jail.set_env("CLEARSTONE_TRACING__BATCH_SIZE", "7");

            let config = ClearstoneConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.tracing.storage_path, PathBuf::from("traces/agent.db"));
            assert_eq!(config.tracing.service_name, "support-bot");
            assert_eq!(config.tracing.batch_size, 7);
            assert_eq!(config.tracing.flush_interval, Duration::from_millis(250));
            assert_eq!(config.checkpoint.checkpoint_dir, PathBuf::from("ckpts"));
            Ok(())
        });
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("bad.toml", "[tracing]\nbatch_size = 0\n")?;
            let result = ClearstoneConfig::from_file("bad.toml");
            assert!(matches!(result, Err(ClearstoneError::Configuration(_))));
            Ok(())
        });
    }
}
