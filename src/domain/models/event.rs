//! Event domain model.
//!
//! Events are immutable lifecycle records queued for asynchronous delivery
//! to hooks. Delivery state lives on the record; terminal states are
//! absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed event type catalog. Custom script events use a `custom.` prefix.
pub mod types {
    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_UPDATED: &str = "agent.updated";
    pub const AGENT_HEARTBEAT_FAILED: &str = "agent.heartbeat_failed";
    pub const AGENT_DISCONNECTED: &str = "agent.disconnected";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";
    pub const CUSTOM_PREFIX: &str = "custom.";
}

/// Delivery state of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Monotonic sequence assigned by the store at append time.
    pub sequence: u64,
    /// Dotted type from the catalog, e.g. `task.failed`.
    pub event_type: String,
    pub status: EventStatus,
    /// Delivery attempts so far; incremented when a worker claims.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Claim never returns the event before this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            event_type: event_type.into(),
            status: EventStatus::Pending,
            attempts: 0,
            last_error: None,
            not_before: None,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Query filter for listing events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub status: Option<EventStatus>,
    pub limit: Option<u32>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, t: impl Into<String>) -> Self {
        self.event_type = Some(t.into());
        self
    }

    pub fn status(mut self, s: EventStatus) -> Self {
        self.status = Some(s);
        self
    }

    pub fn limit(mut self, n: u32) -> Self {
        self.limit = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            EventStatus::Pending,
            EventStatus::Processing,
            EventStatus::Completed,
            EventStatus::Failed,
            EventStatus::Cancelled,
        ] {
            assert_eq!(EventStatus::parse_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(EventStatus::Completed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(EventStatus::Cancelled.is_terminal());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
    }

    #[test]
    fn test_new_event_is_pending() {
        let event = Event::new(types::TASK_STARTED, serde_json::json!({"task": "build"}));
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert!(event.not_before.is_none());
    }
}
