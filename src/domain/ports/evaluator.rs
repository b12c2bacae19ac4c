//! Script evaluation port.
//!
//! The DSL runtime and module catalog are external collaborators; the
//! agent core only drives this interface. One job runs per evaluator
//! invocation, inside its own sandbox.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::models::Value;

use super::dispatcher::OutputKind;

/// Input to one evaluation.
#[derive(Debug, Clone)]
pub struct EvalJob {
    pub task_run_id: Uuid,
    /// DSL source, or a raw shell command for ad-hoc execution.
    pub script_source: String,
    pub params: BTreeMap<String, Value>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Unframed output produced while a job runs; the executor assigns
/// sequence numbers when forwarding.
#[derive(Debug, Clone)]
pub struct EvalOutput {
    pub kind: OutputKind,
    pub data: Vec<u8>,
}

/// Terminal outcome of one evaluation.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub success: bool,
    /// "ok", "timeout", "cancelled", or the failure message.
    pub exit_reason: String,
    pub output: Option<Value>,
}

impl EvalOutcome {
    pub fn ok(output: Option<Value>) -> Self {
        Self { success: true, exit_reason: "ok".to_string(), output }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { success: false, exit_reason: reason.into(), output: None }
    }

    pub fn timeout() -> Self {
        Self::failed("timeout")
    }

    pub fn cancelled() -> Self {
        Self::failed("cancelled")
    }
}

/// Executes one job at a time in a fresh sandbox.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn run(
        &self,
        job: EvalJob,
        output: mpsc::Sender<EvalOutput>,
        cancel: CancellationToken,
    ) -> EvalOutcome;
}
