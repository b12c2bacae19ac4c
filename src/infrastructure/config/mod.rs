//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("database path cannot be empty")]
    EmptyDatabasePath,

    #[error("heartbeat interval must be at least 1 second")]
    InvalidHeartbeatInterval,

    #[error("hook worker pool cannot be empty")]
    EmptyWorkerPool,

    #[error("hook max_attempts cannot be 0")]
    InvalidMaxAttempts,

    #[error("invalid backoff: initial ({0}s) must not exceed max ({1}s)")]
    InvalidBackoff(u64, u64),

    #[error("max_parallel_tasks cannot be 0")]
    InvalidMaxParallelTasks,
}

/// Loads configuration with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.sloth/config.yaml` (project config)
    /// 3. `.sloth/local.yaml` (local overrides)
    /// 4. Environment variables (`SLOTH_` prefix, `__` nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".sloth/config.yaml"))
            .merge(Yaml::file(".sloth/local.yaml"))
            .merge(Env::prefixed("SLOTH_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.heartbeat.interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        if config.agent.max_parallel_tasks == 0 {
            return Err(ConfigError::InvalidMaxParallelTasks);
        }

        if config.hooks.workers == 0 {
            return Err(ConfigError::EmptyWorkerPool);
        }
        if config.hooks.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }
        if config.hooks.initial_backoff_secs > config.hooks.max_backoff_secs {
            return Err(ConfigError::InvalidBackoff(
                config.hooks.initial_backoff_secs,
                config.hooks.max_backoff_secs,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.database.path, ".sloth/sloth.db");
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.hooks.workers = 0;
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::EmptyWorkerPool)));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.hooks.initial_backoff_secs = 600;
        config.hooks.max_backoff_secs = 300;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(600, 300))
        ));
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base = NamedTempFile::new().unwrap();
        writeln!(base, "master:\n  port: 6000\nlogging:\n  level: info").unwrap();
        base.flush().unwrap();

        let mut overlay = NamedTempFile::new().unwrap();
        writeln!(overlay, "logging:\n  level: debug").unwrap();
        overlay.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base.path()))
            .merge(Yaml::file(overlay.path()))
            .extract()
            .unwrap();

        assert_eq!(config.master.port, 6000, "base value survives");
        assert_eq!(config.logging.level, "debug", "overlay wins");
        assert_eq!(config.logging.format, "pretty", "defaults persist");
    }
}
