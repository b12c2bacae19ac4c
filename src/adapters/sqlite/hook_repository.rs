//! SQLite implementation of the hook repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::models::Hook;
use crate::domain::ports::{EventStoreError, HookRepository};

use super::{parse_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteHookRepository {
    pool: SqlitePool,
}

impl SqliteHookRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HookRepository for SqliteHookRepository {
    async fn insert(&self, hook: &Hook) -> Result<(), EventStoreError> {
        sqlx::query(
            "INSERT INTO hooks (id, name, event_type, action, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(hook.id.to_string())
        .bind(&hook.name)
        .bind(&hook.event_type)
        .bind(&hook.action)
        .bind(i64::from(hook.enabled))
        .bind(hook.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), EventStoreError> {
        sqlx::query("DELETE FROM hooks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Hook>, EventStoreError> {
        let rows: Vec<HookRow> = sqlx::query_as(
            "SELECT id, name, event_type, action, enabled, created_at FROM hooks ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::Query(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(Hook {
                    id: parse_uuid(&row.id).map_err(EventStoreError::Query)?,
                    name: row.name,
                    event_type: row.event_type,
                    action: row.action,
                    enabled: row.enabled != 0,
                    created_at: parse_datetime(&row.created_at).map_err(EventStoreError::Query)?,
                })
            })
            .collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HookRow {
    id: String,
    name: String,
    event_type: String,
    action: String,
    enabled: i64,
    created_at: String,
}
