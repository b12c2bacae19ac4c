//! Agent persistence port.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::AgentRecord;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent {0:?} is not registered")]
    Unknown(String),
    #[error("invalid selector: {0}")]
    Selector(#[from] crate::domain::models::SelectorError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Write-through storage behind the in-memory registry, so registrations
/// survive a master restart.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn upsert(&self, record: &AgentRecord) -> Result<(), RegistryError>;

    async fn delete(&self, name: &str) -> Result<(), RegistryError>;

    /// All persisted records, used once at boot.
    async fn load_all(&self) -> Result<Vec<AgentRecord>, RegistryError>;
}
