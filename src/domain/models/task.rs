//! Task domain model.
//!
//! A task is a unit of work: a script fragment plus parameters, placement
//! and failure policy. Descriptors are immutable once a workflow run
//! begins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::value::Value;

/// Default per-task timeout (5 minutes).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl Default for BackoffKind {
    fn default() -> Self {
        Self::Fixed
    }
}

/// Per-task retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Minimum 1.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Delay before the first retry.
    #[serde(default, with = "duration_secs")]
    pub initial_delay: Duration,
    /// Upper clamp on the computed delay.
    #[serde(default = "default_max_delay", with = "duration_secs")]
    pub max_delay: Duration,
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffKind::Fixed,
            initial_delay: Duration::from_secs(1),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before the given retry. `attempt` is the attempt that
    /// just failed, 1-based; exponential doubles per failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::Fixed => self.initial_delay,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
                self.initial_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// An immutable task definition within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Stable id within the workflow run.
    pub id: String,
    pub name: String,
    /// Opaque script text executed by the agent's evaluator.
    pub script_source: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Agent selector; empty string means run locally on the master.
    #[serde(default)]
    pub delegate_to: String,
    /// Broadcast to every selected agent instead of picking one.
    #[serde(default)]
    pub fanout: bool,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_timeout() -> Duration {
    DEFAULT_TASK_TIMEOUT
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>, script_source: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            script_source: script_source.into(),
            params: BTreeMap::new(),
            depends_on: Vec::new(),
            delegate_to: String::new(),
            fanout: false,
            timeout: DEFAULT_TASK_TIMEOUT,
            retry: RetryPolicy::default(),
            env: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn delegate_to(mut self, selector: impl Into<String>) -> Self {
        self.delegate_to = selector.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Scheduling state of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Serialize `Duration` as whole seconds, matching config and YAML
/// workflow files.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(5), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_clamps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffKind::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
    }

    #[test]
    fn test_descriptor_defaults() {
        let task = TaskDescriptor::new("build", "exec('make')");
        assert_eq!(task.timeout, DEFAULT_TASK_TIMEOUT);
        assert_eq!(task.retry.max_attempts, 1);
        assert!(task.delegate_to.is_empty());
        assert!(!task.fanout);
    }

    #[test]
    fn test_descriptor_yaml_round_trip() {
        let yaml = r#"
id: deploy
name: deploy
script_source: "pkg.install('nginx')"
depends_on: [build]
delegate_to: "role==web"
timeout: 120
retry:
  max_attempts: 3
  backoff: exponential
  initial_delay: 1
"#;
        let task: TaskDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.depends_on, vec!["build"]);
        assert_eq!(task.timeout, Duration::from_secs(120));
        assert_eq!(task.retry.backoff, BackoffKind::Exponential);
        assert_eq!(task.retry.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
