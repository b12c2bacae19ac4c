//! Hook domain model.
//!
//! A hook is a registered action invoked when matching events occur. Hooks
//! must be idempotent: delivery is at-least-once and each invocation
//! carries the event id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub id: Uuid,
    pub name: String,
    /// Exact dotted type or a glob (`*` matches one segment, a trailing
    /// `*` matches the rest).
    pub event_type: String,
    /// Command line executed on each matching event.
    pub action: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Hook {
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            event_type: event_type.into(),
            action: action.into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    /// Whether this hook fires for the given event type.
    pub fn matches(&self, event_type: &str) -> bool {
        self.enabled && glob_match(&self.event_type, event_type)
    }
}

/// Match a dotted glob against a dotted event type.
///
/// `task.failed` matches exactly; `task.*` matches any single trailing
/// segment; a bare `*` matches everything.
pub fn glob_match(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let mut pat = pattern.split('.').peekable();
    let mut evt = event_type.split('.').peekable();

    loop {
        match (pat.next(), evt.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {
                // A trailing `*` swallows the remaining segments.
                if pat.peek().is_none() {
                    return true;
                }
            }
            (Some(p), Some(e)) if p == e => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(glob_match("task.failed", "task.failed"));
        assert!(!glob_match("task.failed", "task.completed"));
    }

    #[test]
    fn test_segment_wildcard() {
        assert!(glob_match("task.*", "task.failed"));
        assert!(glob_match("task.*", "task.completed"));
        assert!(!glob_match("task.*", "agent.registered"));
    }

    #[test]
    fn test_trailing_wildcard_swallows_rest() {
        assert!(glob_match("custom.*", "custom.deploy.finished"));
        assert!(glob_match("*", "anything.at.all"));
    }

    #[test]
    fn test_wildcard_needs_a_segment() {
        assert!(!glob_match("task.*", "task"));
    }

    #[test]
    fn test_disabled_hook_never_matches() {
        let mut hook = Hook::new("notify", "task.*", "/usr/local/bin/notify.sh");
        assert!(hook.matches("task.failed"));
        hook.enabled = false;
        assert!(!hook.matches("task.failed"));
    }
}
