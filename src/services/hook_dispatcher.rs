//! Hook dispatcher: drains the event store and fans events out to
//! matching hooks with a bounded worker pool.
//!
//! Delivery is at-least-once; hooks must be idempotent and receive the
//! event id on every invocation. An event completes when every matching
//! hook ran successfully, or immediately when nothing matches.

use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::models::{Event, Hook, HookDispatcherConfig};
use crate::domain::ports::{EventStore, HookRepository};

pub struct HookDispatcher {
    store: Arc<dyn EventStore>,
    hooks: Arc<dyn HookRepository>,
    config: HookDispatcherConfig,
}

impl HookDispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        hooks: Arc<dyn HookRepository>,
        config: HookDispatcherConfig,
    ) -> Self {
        Self { store, hooks, config }
    }

    /// Start the poller and worker pool. Orphaned Processing events from a
    /// previous process are recovered first so none sit there forever.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        match self.store.recover_orphans().await {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "recovered orphaned in-flight events"),
            Err(e) => warn!(error = %e, "failed to recover orphaned events"),
        }

        let (queue_tx, queue_rx) = mpsc::channel::<Event>(self.config.queue_depth);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut handles = Vec::with_capacity(self.config.workers + 1);

        let poller = self.clone();
        let poller_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            poller.poll_loop(queue_tx, poller_cancel).await;
        }));

        for worker_id in 0..self.config.workers {
            let dispatcher = self.clone();
            let rx = queue_rx.clone();
            let worker_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id, rx, worker_cancel).await;
            }));
        }

        handles
    }

    async fn poll_loop(&self, queue: mpsc::Sender<Event>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let batch = match self.store.claim(self.config.claim_batch).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "event claim failed");
                    Vec::new()
                }
            };
            let drained = batch.is_empty();

            for event in batch {
                if queue.send(event).await.is_err() {
                    return;
                }
            }

            if drained {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        queue: Arc<Mutex<mpsc::Receiver<Event>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    event = rx.recv() => event,
                    _ = cancel.cancelled() => return,
                }
            };
            let Some(event) = event else { return };
            debug!(worker_id, event = %event.id, event_type = %event.event_type, "delivering event");
            self.process_event(&event).await;
        }
    }

    /// Deliver one claimed event to every matching hook and settle its
    /// delivery state.
    pub async fn process_event(&self, event: &Event) {
        let matching = match self.hooks.matching(&event.event_type).await {
            Ok(matching) => matching,
            Err(e) => {
                warn!(event = %event.id, error = %e, "failed to load hooks");
                self.settle_failure(event, format!("hook lookup failed: {e}")).await;
                return;
            }
        };

        if matching.is_empty() {
            if let Err(e) = self.store.complete(event.id).await {
                warn!(event = %event.id, error = %e, "failed to complete unmatched event");
            }
            return;
        }

        let mut first_error: Option<String> = None;
        for hook in &matching {
            if let Err(e) = self.run_hook(hook, event).await {
                warn!(event = %event.id, hook = %hook.name, error = %e, "hook invocation failed");
                first_error.get_or_insert(format!("hook {}: {e}", hook.name));
            }
        }

        match first_error {
            None => {
                if let Err(e) = self.store.complete(event.id).await {
                    warn!(event = %event.id, error = %e, "failed to complete event");
                }
            }
            Some(error) => self.settle_failure(event, error).await,
        }
    }

    /// Retry with exponential backoff until attempts are exhausted.
    async fn settle_failure(&self, event: &Event, error: String) {
        if event.attempts >= self.config.max_attempts {
            warn!(event = %event.id, attempts = event.attempts, "delivery attempts exhausted");
            if let Err(e) = self.store.fail(event.id, &error).await {
                warn!(event = %event.id, error = %e, "failed to mark event failed");
            }
            return;
        }

        let delay = self.config.retry_delay(event.attempts);
        debug!(event = %event.id, attempts = event.attempts, ?delay, "scheduling delivery retry");
        if let Err(e) = self.store.retry(event.id, delay, &error).await {
            warn!(event = %event.id, error = %e, "failed to schedule retry");
        }
    }

    /// Run one hook command with the event exposed through the
    /// environment; non-zero exit or timeout is a failure.
    async fn run_hook(&self, hook: &Hook, event: &Event) -> Result<(), String> {
        let payload =
            serde_json::to_string(&event.payload).map_err(|e| format!("payload encode: {e}"))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&hook.action)
            .env("SLOTH_EVENT_ID", event.id.to_string())
            .env("SLOTH_EVENT_TYPE", &event.event_type)
            .env("SLOTH_EVENT_PAYLOAD", payload)
            .env("SLOTH_EVENT_ATTEMPT", event.attempts.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.hook_timeout(), cmd.output())
            .await
            .map_err(|_| "timeout".to_string())?
            .map_err(|e| format!("spawn failed: {e}"))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "exit status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteEventRepository, SqliteHookRepository,
    };
    use crate::domain::models::EventStatus;

    async fn fixture() -> (Arc<SqliteEventRepository>, Arc<SqliteHookRepository>, HookDispatcher) {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = Arc::new(SqliteEventRepository::new(pool.clone()));
        let hooks = Arc::new(SqliteHookRepository::new(pool));
        let dispatcher = HookDispatcher::new(
            store.clone(),
            hooks.clone(),
            HookDispatcherConfig { max_attempts: 3, ..HookDispatcherConfig::default() },
        );
        (store, hooks, dispatcher)
    }

    #[tokio::test]
    async fn test_unmatched_event_completes_immediately() {
        let (store, _hooks, dispatcher) = fixture().await;
        let id = store.append("task.completed", serde_json::json!({})).await.unwrap();

        let claimed = store.claim(1).await.unwrap();
        dispatcher.process_event(&claimed[0]).await;

        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_successful_hook_completes_event() {
        let (store, hooks, dispatcher) = fixture().await;
        hooks.insert(&Hook::new("ok", "task.*", "true")).await.unwrap();

        let id = store.append("task.failed", serde_json::json!({"t": "x"})).await.unwrap();
        let claimed = store.claim(1).await.unwrap();
        dispatcher.process_event(&claimed[0]).await;

        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Completed);
        assert_eq!(event.attempts, 1);
    }

    #[tokio::test]
    async fn test_failing_hook_schedules_retry_then_fails() {
        let (store, hooks, dispatcher) = fixture().await;
        hooks.insert(&Hook::new("broken", "task.*", "exit 7")).await.unwrap();

        let id = store.append("task.failed", serde_json::json!({})).await.unwrap();

        // Exhaust all three attempts: the first two schedule retries.
        for expected_attempts in 1..=3u32 {
            // Clear any backoff so the claim sees the event.
            if expected_attempts > 1 {
                sqlx_reset_not_before(&store, id).await;
            }
            let claimed = store.claim(1).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {expected_attempts}");
            assert_eq!(claimed[0].attempts, expected_attempts);
            dispatcher.process_event(&claimed[0]).await;
        }

        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.attempts, 3);
        assert!(event.last_error.as_deref().unwrap_or("").contains("exit status 7"));
    }

    #[tokio::test]
    async fn test_hook_sees_event_environment() {
        let (store, hooks, dispatcher) = fixture().await;
        // The hook only succeeds when the event type env var is present.
        hooks
            .insert(&Hook::new("check-env", "task.*", "test \"$SLOTH_EVENT_TYPE\" = task.failed"))
            .await
            .unwrap();

        let id = store.append("task.failed", serde_json::json!({})).await.unwrap();
        let claimed = store.claim(1).await.unwrap();
        dispatcher.process_event(&claimed[0]).await;

        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_worker_pool_drains_queue() {
        let (store, hooks, dispatcher) = fixture().await;
        hooks.insert(&Hook::new("ok", "*", "true")).await.unwrap();

        for i in 0..5 {
            store.append("task.completed", serde_json::json!({"n": i})).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(dispatcher);
        let handles = dispatcher.clone().start(cancel.clone()).await;

        // Wait for every event to settle.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let pending = store
                .list(crate::domain::models::EventFilter::new().status(EventStatus::Completed))
                .await
                .unwrap();
            if pending.len() == 5 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "events never completed");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn sqlx_reset_not_before(store: &SqliteEventRepository, id: uuid::Uuid) {
        // Test helper: fast-forward past the retry backoff.
        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        store.clear_not_before(id).await.unwrap();
    }
}
