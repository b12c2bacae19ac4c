//! Event store + hook dispatcher integration: at-least-once delivery with
//! retries against real subprocess hooks.

use std::sync::Arc;

use sloth_runner::adapters::sqlite::{
    create_migrated_test_pool, SqliteEventRepository, SqliteHookRepository,
};
use sloth_runner::domain::models::{EventStatus, Hook, HookDispatcherConfig};
use sloth_runner::domain::ports::{EventStore, HookRepository};
use sloth_runner::services::HookDispatcher;

/// Backoff-free dispatcher config so retries are immediately claimable.
fn fast_config(max_attempts: u32) -> HookDispatcherConfig {
    HookDispatcherConfig {
        workers: 4,
        queue_depth: 16,
        claim_batch: 8,
        poll_interval_ms: 10,
        hook_timeout_secs: 5,
        max_attempts,
        initial_backoff_secs: 0,
        max_backoff_secs: 0,
    }
}

async fn fixture(
    max_attempts: u32,
) -> (Arc<SqliteEventRepository>, Arc<SqliteHookRepository>, HookDispatcher) {
    let pool = create_migrated_test_pool().await.unwrap();
    let store = Arc::new(SqliteEventRepository::new(pool.clone()));
    let hooks = Arc::new(SqliteHookRepository::new(pool));
    let dispatcher = HookDispatcher::new(store.clone(), hooks.clone(), fast_config(max_attempts));
    (store, hooks, dispatcher)
}

#[tokio::test]
async fn test_hook_succeeding_on_fourth_attempt_completes_event() {
    let (store, hooks, dispatcher) = fixture(5).await;

    // The hook fails three times, then succeeds, tracked through a
    // counter file. Delivery must be retried until it lands.
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("attempts");
    let action = format!(
        "n=$(cat {path} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {path}; [ $n -ge 4 ]",
        path = counter.display()
    );
    hooks.insert(&Hook::new("flaky", "task.failed", action)).await.unwrap();

    let id = store
        .append("task.failed", serde_json::json!({"task": "deploy"}))
        .await
        .unwrap();

    for _ in 0..4 {
        let claimed = store.claim(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        dispatcher.process_event(&claimed[0]).await;
    }

    let event = store.get(id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert_eq!(event.attempts, 4);
}

#[tokio::test]
async fn test_every_matching_hook_runs_independently() {
    let (store, hooks, dispatcher) = fixture(5).await;

    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    hooks
        .insert(&Hook::new("touch-a", "task.*", format!("touch {}", a.display())))
        .await
        .unwrap();
    hooks
        .insert(&Hook::new("touch-b", "task.failed", format!("touch {}", b.display())))
        .await
        .unwrap();

    store.append("task.failed", serde_json::json!({})).await.unwrap();
    let claimed = store.claim(1).await.unwrap();
    dispatcher.process_event(&claimed[0]).await;

    assert!(a.exists(), "glob hook fired");
    assert!(b.exists(), "exact hook fired");
}

#[tokio::test]
async fn test_exhausted_delivery_marks_event_failed() {
    let (store, hooks, dispatcher) = fixture(2).await;
    hooks.insert(&Hook::new("always-broken", "task.*", "false")).await.unwrap();

    let id = store.append("task.failed", serde_json::json!({})).await.unwrap();
    for _ in 0..2 {
        let claimed = store.claim(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        dispatcher.process_event(&claimed[0]).await;
    }

    let event = store.get(id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert!(event.last_error.is_some());

    // Operator requeue resets the delivery attempts.
    store.requeue(id).await.unwrap();
    let event = store.get(id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.attempts, 0);
}

#[tokio::test]
async fn test_payload_reaches_hook_byte_equal() {
    let (store, hooks, dispatcher) = fixture(1).await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("payload");
    hooks
        .insert(&Hook::new(
            "record",
            "custom.*",
            format!("printf %s \"$SLOTH_EVENT_PAYLOAD\" > {}", out.display()),
        ))
        .await
        .unwrap();

    let payload = serde_json::json!({"answer": 42, "items": ["a", "b"]});
    store.append("custom.metric", payload.clone()).await.unwrap();
    let claimed = store.claim(1).await.unwrap();
    dispatcher.process_event(&claimed[0]).await;

    let written = std::fs::read_to_string(&out).unwrap();
    let round_tripped: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(round_tripped, payload);
}
