//! SQLite implementation of the durable event queue.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::models::{Event, EventFilter, EventStatus};
use crate::domain::ports::{EventStore, EventStoreError};

use super::{parse_optional_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteEventRepository {
    pool: SqlitePool,
}

impl SqliteEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: EventRow) -> Result<Event, EventStoreError> {
        Ok(Event {
            id: parse_uuid(&row.id).map_err(EventStoreError::Query)?,
            sequence: row.sequence as u64,
            event_type: row.event_type,
            status: EventStatus::parse_str(&row.status).unwrap_or(EventStatus::Pending),
            attempts: row.attempts as u32,
            last_error: row.last_error,
            not_before: parse_optional_datetime(row.not_before).map_err(EventStoreError::Query)?,
            payload: serde_json::from_str(&row.payload)
                .map_err(|e| EventStoreError::Serialization(e.to_string()))?,
            created_at: super::parse_datetime(&row.created_at).map_err(EventStoreError::Query)?,
        })
    }

    async fn fetch(&self, id: Uuid) -> Result<Event, EventStoreError> {
        self.get(id).await?.ok_or(EventStoreError::NotFound(id))
    }

    /// Test support: drop a retry delay so the event claims immediately.
    #[cfg(test)]
    pub async fn clear_not_before(&self, id: Uuid) -> Result<(), EventStoreError> {
        sqlx::query("UPDATE events SET not_before = NULL WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Guarded status transition. `from` restricts which source states are
    /// legal; terminal states are absorbing by construction.
    async fn transition(
        &self,
        id: Uuid,
        from: &[EventStatus],
        to: EventStatus,
        error: Option<&str>,
        not_before: Option<String>,
    ) -> Result<(), EventStoreError> {
        let froms: Vec<&str> = from.iter().map(EventStatus::as_str).collect();
        let placeholders = vec!["?"; froms.len()].join(", ");
        let sql = format!(
            "UPDATE events SET status = ?, last_error = ?, not_before = ? \
             WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(error)
            .bind(not_before)
            .bind(id.to_string());
        for f in froms {
            query = query.bind(f);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            let current = self.fetch(id).await?;
            return Err(EventStoreError::Terminal {
                id,
                status: current.status.as_str().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteEventRepository {
    async fn append(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, EventStoreError> {
        let id = Uuid::new_v4();
        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        // Sequence assignment rides the insert; SQLite serializes writers
        // so MAX+1 is race-free within one master process.
        sqlx::query(
            r#"
            INSERT INTO events (id, sequence, event_type, status, attempts, payload, created_at)
            VALUES (?, (SELECT COALESCE(MAX(sequence), 0) + 1 FROM events), ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(event_type)
        .bind(payload_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Append(e.to_string()))?;

        Ok(id)
    }

    async fn claim(&self, n: u32) -> Result<Vec<Event>, EventStoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM events
             WHERE status = 'pending' AND (not_before IS NULL OR not_before <= ?)
             ORDER BY sequence ASC LIMIT ?",
        )
        .bind(&now)
        .bind(n as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| EventStoreError::Query(e.to_string()))?;

        let mut claimed = Vec::with_capacity(ids.len());
        for (id,) in &ids {
            sqlx::query(
                "UPDATE events SET status = 'processing', attempts = attempts + 1
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

            let row: EventRow = sqlx::query_as(
                "SELECT id, sequence, event_type, status, attempts, last_error, not_before,
                        payload, created_at
                 FROM events WHERE id = ?",
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| EventStoreError::Query(e.to_string()))?;
            claimed.push(Self::row_to_event(row)?);
        }

        tx.commit()
            .await
            .map_err(|e| EventStoreError::Database(e.to_string()))?;

        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), EventStoreError> {
        self.transition(id, &[EventStatus::Processing], EventStatus::Completed, None, None)
            .await
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), EventStoreError> {
        self.transition(id, &[EventStatus::Processing], EventStatus::Failed, Some(error), None)
            .await
    }

    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), EventStoreError> {
        let not_before = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.transition(
            id,
            &[EventStatus::Processing],
            EventStatus::Pending,
            Some(error),
            Some(not_before.to_rfc3339()),
        )
        .await
    }

    async fn cancel(&self, id: Uuid) -> Result<(), EventStoreError> {
        self.transition(
            id,
            &[EventStatus::Pending, EventStatus::Processing],
            EventStatus::Cancelled,
            None,
            None,
        )
        .await
    }

    async fn requeue(&self, id: Uuid) -> Result<(), EventStoreError> {
        let event = self.fetch(id).await?;
        if !event.status.is_terminal() {
            return Err(EventStoreError::Terminal {
                id,
                status: event.status.as_str().to_string(),
            });
        }

        sqlx::query(
            "UPDATE events SET status = 'pending', attempts = 0, last_error = NULL, not_before = NULL
             WHERE id = ?",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Event>, EventStoreError> {
        let row: Option<EventRow> = sqlx::query_as(
            "SELECT id, sequence, event_type, status, attempts, last_error, not_before,
                    payload, created_at
             FROM events WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EventStoreError::Query(e.to_string()))?;

        row.map(Self::row_to_event).transpose()
    }

    async fn list(&self, filter: EventFilter) -> Result<Vec<Event>, EventStoreError> {
        let mut sql = String::from(
            "SELECT id, sequence, event_type, status, attempts, last_error, not_before,
                    payload, created_at
             FROM events WHERE 1=1",
        );
        if filter.event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY sequence DESC");
        sql.push_str(" LIMIT ?");

        let mut query = sqlx::query_as::<_, EventRow>(&sql);
        if let Some(ref t) = filter.event_type {
            query = query.bind(t);
        }
        if let Some(s) = filter.status {
            query = query.bind(s.as_str());
        }
        query = query.bind(filter.limit.unwrap_or(100) as i64);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::Query(e.to_string()))?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn recover_orphans(&self) -> Result<u64, EventStoreError> {
        let result =
            sqlx::query("UPDATE events SET status = 'pending' WHERE status = 'processing'")
                .execute(&self.pool)
                .await
                .map_err(|e| EventStoreError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    sequence: i64,
    event_type: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    not_before: Option<String>,
    payload: String,
    created_at: String,
}
