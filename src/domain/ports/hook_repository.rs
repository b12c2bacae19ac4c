//! Hook persistence port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::models::Hook;

use super::event_store::EventStoreError;

#[async_trait]
pub trait HookRepository: Send + Sync {
    async fn insert(&self, hook: &Hook) -> Result<(), EventStoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), EventStoreError>;

    async fn list(&self) -> Result<Vec<Hook>, EventStoreError>;

    /// Enabled hooks whose pattern matches the event type.
    async fn matching(&self, event_type: &str) -> Result<Vec<Hook>, EventStoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|h| h.matches(event_type))
            .collect())
    }
}
