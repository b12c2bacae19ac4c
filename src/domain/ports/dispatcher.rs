//! Dispatch port: how the engine hands a task to an agent.
//!
//! The control plane implements this; the engine only sees the trait, so
//! the registry ↔ dispatcher ↔ engine graph stays acyclic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::models::Value;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("agent {0:?} is not registered")]
    AgentUnknown(String),
    #[error("agent {0:?} is unreachable")]
    AgentUnreachable(String),
    #[error("agent {0:?} has no free task slots")]
    AgentBusy(String),
    #[error("local execution is not available on this node")]
    LocalUnavailable,
}

/// Wire payload for a task dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_run_id: Uuid,
    pub script_source: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub workflow_run_id: Option<Uuid>,
}

impl TaskPayload {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Wire payload for an ad-hoc shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellPayload {
    pub task_run_id: Uuid,
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl ShellPayload {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Kind of a streamed output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Log,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Log => "log",
        }
    }
}

/// One streamed chunk of task output.
///
/// Sequence numbers per `task_run_id` are contiguous and start at 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    pub task_run_id: Uuid,
    pub kind: OutputKind,
    pub data: Vec<u8>,
    pub seq: u64,
}

/// Terminal status of a dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalStatus {
    pub task_run_id: Uuid,
    pub success: bool,
    pub exit_reason: String,
    pub output_blob: Option<Value>,
    pub duration_ms: u64,
}

/// Items arriving on a dispatch stream.
///
/// The stream ends after `Done`; if the channel closes without one, the
/// agent became unreachable mid-task.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Chunk(OutputChunk),
    /// Custom event raised by the script, forwarded verbatim to the store.
    Custom { event_type: String, payload: serde_json::Value },
    Done(FinalStatus),
}

/// Streaming task dispatch to named agents.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Forward a task payload to the named agent over its control channel.
    async fn dispatch(
        &self,
        agent: &str,
        payload: TaskPayload,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DispatchEvent>, DispatchError>;

    /// Run a task on this node, bypassing the control plane.
    async fn dispatch_local(
        &self,
        payload: TaskPayload,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DispatchEvent>, DispatchError>;

    /// Tasks currently in flight on the named agent.
    fn in_flight(&self, agent: &str) -> usize;

    /// Take a buffered final status re-delivered after a channel drop.
    ///
    /// Authoritative only while the engine still considers the task
    /// Running.
    async fn take_late_result(&self, task_run_id: Uuid) -> Option<FinalStatus>;
}
