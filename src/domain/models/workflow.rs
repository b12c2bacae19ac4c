//! Workflow domain model.
//!
//! A workflow is a DAG of tasks with dependencies and per-task placement.
//! Definitions are produced by the DSL runtime; the engine consumes them
//! as typed data and never parses scripts itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::task::{TaskDescriptor, TaskState};
use super::value::Value;

/// A typed workflow definition.
///
/// Task order is the definition order and drives FIFO scheduling among
/// ready tasks, which keeps runs deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub tasks: Vec<TaskDescriptor>,
    /// Optional whole-run deadline in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), tasks: Vec::new(), timeout_secs: None }
    }

    pub fn with_task(mut self, task: TaskDescriptor) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn task(&self, id: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every task succeeded.
    Completed,
    /// At least one task failed or was skipped.
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal report of one task within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub state: TaskState,
    pub agent: Option<String>,
    pub attempts: u32,
    pub exit_reason: Option<String>,
    pub duration_ms: u64,
}

/// Final report of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub tasks: Vec<TaskReport>,
    /// Outputs of succeeded tasks, keyed by task id.
    pub outputs: BTreeMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Progress notifications streamed to `run` clients while a workflow
/// executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunNotice {
    RunStarted { run_id: Uuid, workflow_name: String },
    TaskStateChanged { task_id: String, state: TaskState, agent: Option<String> },
    TaskOutput { task_id: String, kind: String, line: String },
    RunFinished { status: RunStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_preserves_order() {
        let wf = WorkflowDefinition::new("deploy")
            .with_task(TaskDescriptor::new("a", "x"))
            .with_task(TaskDescriptor::new("b", "y"));
        let ids: Vec<&str> = wf.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(wf.task("b").is_some());
        assert!(wf.task("c").is_none());
    }

    #[test]
    fn test_definition_yaml() {
        let yaml = r#"
name: two_step
timeout_secs: 600
tasks:
  - id: hello
    name: hello
    script_source: "exec('echo hi')"
  - id: bye
    name: bye
    script_source: "exec('echo bye')"
    depends_on: [hello]
"#;
        let wf: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(wf.name, "two_step");
        assert_eq!(wf.tasks.len(), 2);
        assert_eq!(wf.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(wf.tasks[1].depends_on, vec!["hello"]);
    }
}
