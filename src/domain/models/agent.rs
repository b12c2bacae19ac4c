//! Agent domain model.
//!
//! An agent is a worker process that executes tasks on behalf of the
//! master. The registry keeps exactly one record per agent name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Liveness status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Heartbeating within the grace period.
    Active,
    /// Heartbeat overdue; channel may be gone.
    Unreachable,
    /// Shut down gracefully.
    Stopped,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Unreachable
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unreachable => "unreachable",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "unreachable" => Some(Self::Unreachable),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique agent name (primary key).
    pub name: String,
    /// host:port the master may probe for diagnostics.
    pub address: String,
    /// Optional override for NAT traversal.
    pub report_address: Option<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Agent binary version string.
    pub version: String,
    /// Selection tags. Values may be comma-separated sets.
    pub tags: BTreeMap<String, String>,
    /// Opaque host facts refreshed by heartbeats.
    pub system_info: BTreeMap<String, String>,
    /// Advertised task concurrency limit.
    pub max_parallel_tasks: u32,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            address: address.into(),
            report_address: None,
            status: AgentStatus::Active,
            last_heartbeat: now,
            version: String::new(),
            tags: BTreeMap::new(),
            system_info: BTreeMap::new(),
            max_parallel_tasks: 4,
            registered_at: now,
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_max_parallel_tasks(mut self, max: u32) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    /// The address the master should use when probing the agent, honoring
    /// the NAT-traversal override.
    pub fn probe_address(&self) -> &str {
        self.report_address.as_deref().unwrap_or(&self.address)
    }

    /// Whether the heartbeat is within the given grace window.
    pub fn heartbeat_fresh(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        now - self.last_heartbeat <= grace
    }
}
