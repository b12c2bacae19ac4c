//! Workflow run persistence port.
//!
//! Best-effort history: the engine records run and task transitions so
//! `run` history survives a master restart. Write failures are logged by
//! callers and never block scheduling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::{RunStatus, TaskState};

use super::event_store::EventStoreError;

/// Persisted snapshot of one task attempt series within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub task_run_id: Uuid,
    pub run_id: Uuid,
    pub task_id: String,
    pub task_name: String,
    pub agent_name: Option<String>,
    pub state: TaskState,
    pub attempts: u32,
    pub exit_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(
        &self,
        run_id: Uuid,
        workflow_name: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), EventStoreError>;

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), EventStoreError>;

    async fn upsert_task_run(&self, record: &TaskRunRecord) -> Result<(), EventStoreError>;

    async fn list_task_runs(&self, run_id: Uuid) -> Result<Vec<TaskRunRecord>, EventStoreError>;
}
