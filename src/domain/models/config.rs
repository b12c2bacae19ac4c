//! Runtime configuration model.
//!
//! Defaults here are the documented protocol constants; the loader merges
//! YAML files and `SLOTH_`-prefixed environment variables over them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub master: MasterConfig,
    pub agent: AgentConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub heartbeat: HeartbeatConfig,
    pub hooks: HookDispatcherConfig,
}

/// Master listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 50053 }
    }
}

impl MasterConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Agent runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_address: String,
    /// Diagnostic probe port.
    pub port: u16,
    pub max_parallel_tasks: u32,
    /// How long a graceful shutdown waits for in-flight tasks.
    pub drain_timeout_secs: u64,
    /// Interpreter used by the process evaluator.
    pub interpreter: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 50051,
            max_parallel_tasks: 4,
            drain_timeout_secs: 30,
            interpreter: "sh".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: ".sloth/sloth.db".to_string(), max_connections: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Optional directory for rolling file output.
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string(), log_dir: None }
    }
}

/// Heartbeat protocol constants.
///
/// Agents send every `interval_secs`; the sweeper runs at half that. An
/// agent is Unreachable past 2 intervals and reported disconnected past 10.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs((self.interval_secs / 2).max(1))
    }

    pub fn unreachable_after(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.interval_secs * 2) as i64)
    }

    pub fn disconnected_after(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.interval_secs * 10) as i64)
    }
}

/// Hook dispatcher pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookDispatcherConfig {
    pub workers: usize,
    pub queue_depth: usize,
    pub claim_batch: u32,
    pub poll_interval_ms: u64,
    pub hook_timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for HookDispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 100,
            queue_depth: 1000,
            claim_batch: 100,
            poll_interval_ms: 500,
            hook_timeout_secs: 30,
            max_attempts: 5,
            initial_backoff_secs: 1,
            max_backoff_secs: 300,
        }
    }
}

impl HookDispatcherConfig {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Exponential backoff for a failed delivery attempt, clamped.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts.saturating_sub(1).min(16));
        let secs = self.initial_backoff_secs.saturating_mul(factor).min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.master.port, 50053);
        assert_eq!(config.agent.port, 50051);
        assert_eq!(config.heartbeat.interval_secs, 10);
        assert_eq!(config.hooks.workers, 100);
        assert_eq!(config.hooks.queue_depth, 1000);
        assert_eq!(config.hooks.max_attempts, 5);
    }

    #[test]
    fn test_heartbeat_windows() {
        let hb = HeartbeatConfig { interval_secs: 10 };
        assert_eq!(hb.sweep_interval(), Duration::from_secs(5));
        assert_eq!(hb.unreachable_after(), chrono::Duration::seconds(20));
        assert_eq!(hb.disconnected_after(), chrono::Duration::seconds(100));
    }

    #[test]
    fn test_hook_retry_delay_clamps() {
        let hooks = HookDispatcherConfig::default();
        assert_eq!(hooks.retry_delay(1), Duration::from_secs(1));
        assert_eq!(hooks.retry_delay(2), Duration::from_secs(2));
        assert_eq!(hooks.retry_delay(3), Duration::from_secs(4));
        assert_eq!(hooks.retry_delay(20), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "master:\n  port: 6000\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.master.port, 6000);
        assert_eq!(config.agent.max_parallel_tasks, 4);
    }
}
