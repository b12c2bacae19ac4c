//! SQLite implementation of the agent repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::domain::models::{AgentRecord, AgentStatus};
use crate::domain::ports::{AgentRepository, RegistryError};

use super::parse_datetime;

#[derive(Clone)]
pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: AgentRow) -> Result<AgentRecord, RegistryError> {
        let tags: BTreeMap<String, String> =
            serde_json::from_str(&row.tags).map_err(|e| RegistryError::Storage(e.to_string()))?;
        let system_info: BTreeMap<String, String> = serde_json::from_str(&row.system_info)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        Ok(AgentRecord {
            name: row.name,
            address: row.address,
            report_address: row.report_address,
            status: AgentStatus::parse_str(&row.status).unwrap_or(AgentStatus::Unreachable),
            last_heartbeat: parse_datetime(&row.last_heartbeat).map_err(RegistryError::Storage)?,
            version: row.version,
            tags,
            system_info,
            max_parallel_tasks: row.max_parallel_tasks as u32,
            registered_at: parse_datetime(&row.registered_at).map_err(RegistryError::Storage)?,
        })
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn upsert(&self, record: &AgentRecord) -> Result<(), RegistryError> {
        let tags = serde_json::to_string(&record.tags)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        let system_info = serde_json::to_string(&record.system_info)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO agents (name, address, report_address, status, last_heartbeat,
                                version, tags, system_info, max_parallel_tasks, registered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                address = excluded.address,
                report_address = excluded.report_address,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                version = excluded.version,
                tags = excluded.tags,
                system_info = excluded.system_info,
                max_parallel_tasks = excluded.max_parallel_tasks
            "#,
        )
        .bind(&record.name)
        .bind(&record.address)
        .bind(&record.report_address)
        .bind(record.status.as_str())
        .bind(record.last_heartbeat.to_rfc3339())
        .bind(&record.version)
        .bind(tags)
        .bind(system_info)
        .bind(record.max_parallel_tasks as i64)
        .bind(record.registered_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| RegistryError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM agents WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT name, address, report_address, status, last_heartbeat, version,
                    tags, system_info, max_parallel_tasks, registered_at
             FROM agents ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RegistryError::Storage(e.to_string()))?;

        rows.into_iter().map(Self::row_to_record).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AgentRow {
    name: String,
    address: String,
    report_address: Option<String>,
    status: String,
    last_heartbeat: String,
    version: String,
    tags: String,
    system_info: String,
    max_parallel_tasks: i64,
    registered_at: String,
}
