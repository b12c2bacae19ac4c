//! Structured logging setup on tracing.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::LoggingConfig;

/// Initialized logging; hold the guard for the lifetime of the process so
/// the file writer flushes.
pub struct Logging {
    _guard: Option<WorkerGuard>,
}

impl Logging {
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let default_level = parse_level(&config.level)?;
        let env_filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();

        let guard = if let Some(ref log_dir) = config.log_dir {
            let file_appender = rolling::daily(log_dir, "sloth-runner.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // File output is always JSON; stderr honors the format config.
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter);

            let stderr_filter = EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy();
            if config.format == "json" {
                let stderr_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter);
                tracing_subscriber::registry().with(file_layer).with(stderr_layer).init();
            } else {
                let stderr_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter);
                tracing_subscriber::registry().with(file_layer).with(stderr_layer).init();
            }
            Some(guard)
        } else {
            if config.format == "json" {
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(layer).init();
            } else {
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(layer).init();
            }
            None
        };

        Ok(Self { _guard: guard })
    }
}

fn parse_level(level: &str) -> Result<Level> {
    match level {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(anyhow!("invalid log level: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert!(parse_level("loud").is_err());
    }
}
