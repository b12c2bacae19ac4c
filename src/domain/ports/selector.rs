//! Agent selection port.
//!
//! The registry implements this; the engine depends only on the trait.

use async_trait::async_trait;

use crate::domain::models::{AgentRecord, SelectorExpr};

use super::agent_repository::RegistryError;

/// Resolves selector expressions to candidate agents.
#[async_trait]
pub trait AgentSelector: Send + Sync {
    /// All agents matching the expression, regardless of status, sorted
    /// lexicographically by name.
    async fn select(&self, expr: &SelectorExpr) -> Result<Vec<AgentRecord>, RegistryError>;
}
