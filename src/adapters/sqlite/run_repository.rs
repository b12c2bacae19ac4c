//! SQLite implementation of the workflow run history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::models::{RunStatus, TaskState};
use crate::domain::ports::{EventStoreError, RunRepository, TaskRunRecord};

use super::{parse_optional_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: SqlitePool,
}

impl SqliteRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn create_run(
        &self,
        run_id: Uuid,
        workflow_name: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), EventStoreError> {
        sqlx::query(
            "INSERT INTO workflow_runs (run_id, workflow_name, status, started_at)
             VALUES (?, ?, 'running', ?)",
        )
        .bind(run_id.to_string())
        .bind(workflow_name)
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), EventStoreError> {
        sqlx::query("UPDATE workflow_runs SET status = ?, finished_at = ? WHERE run_id = ?")
            .bind(status.as_str())
            .bind(finished_at.to_rfc3339())
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn upsert_task_run(&self, record: &TaskRunRecord) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_runs (task_run_id, run_id, task_id, task_name, agent_name,
                                   status, attempts, exit_reason, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_run_id) DO UPDATE SET
                agent_name = excluded.agent_name,
                status = excluded.status,
                attempts = excluded.attempts,
                exit_reason = excluded.exit_reason,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(record.task_run_id.to_string())
        .bind(record.run_id.to_string())
        .bind(&record.task_id)
        .bind(&record.task_name)
        .bind(&record.agent_name)
        .bind(record.state.as_str())
        .bind(record.attempts as i64)
        .bind(&record.exit_reason)
        .bind(record.started_at.map(|t| t.to_rfc3339()))
        .bind(record.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_task_runs(&self, run_id: Uuid) -> Result<Vec<TaskRunRecord>, EventStoreError> {
        let rows: Vec<TaskRunRow> = sqlx::query_as(
            "SELECT task_run_id, run_id, task_id, task_name, agent_name, status, attempts,
                    exit_reason, started_at, finished_at
             FROM task_runs WHERE run_id = ? ORDER BY started_at",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::Query(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(TaskRunRecord {
                    task_run_id: parse_uuid(&row.task_run_id).map_err(EventStoreError::Query)?,
                    run_id: parse_uuid(&row.run_id).map_err(EventStoreError::Query)?,
                    task_id: row.task_id,
                    task_name: row.task_name,
                    agent_name: row.agent_name,
                    state: parse_task_state(&row.status),
                    attempts: row.attempts as u32,
                    exit_reason: row.exit_reason,
                    started_at: parse_optional_datetime(row.started_at)
                        .map_err(EventStoreError::Query)?,
                    finished_at: parse_optional_datetime(row.finished_at)
                        .map_err(EventStoreError::Query)?,
                })
            })
            .collect()
    }
}

fn parse_task_state(s: &str) -> TaskState {
    match s {
        "ready" => TaskState::Ready,
        "running" => TaskState::Running,
        "succeeded" => TaskState::Succeeded,
        "failed" => TaskState::Failed,
        "skipped" => TaskState::Skipped,
        _ => TaskState::Pending,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRunRow {
    task_run_id: String,
    run_id: String,
    task_id: String,
    task_name: String,
    agent_name: Option<String>,
    status: String,
    attempts: i64,
    exit_reason: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
}
