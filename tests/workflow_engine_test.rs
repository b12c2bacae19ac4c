//! Workflow engine integration tests over in-memory fakes and a real
//! SQLite event store.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{active_agent, FakeDispatcher, FakeSelector, Outcome};
use sloth_runner::adapters::sqlite::{create_migrated_test_pool, SqliteEventRepository};
use sloth_runner::domain::models::{
    BackoffKind, EventFilter, RetryPolicy, RunStatus, TaskDescriptor, TaskState,
    WorkflowDefinition,
};
use sloth_runner::domain::ports::EventStore;
use sloth_runner::services::{EngineError, WorkflowEngine};

async fn engine_with(
    agents: Vec<sloth_runner::domain::models::AgentRecord>,
    dispatcher: Arc<FakeDispatcher>,
) -> (WorkflowEngine, Arc<SqliteEventRepository>) {
    let pool = create_migrated_test_pool().await.unwrap();
    let store = Arc::new(SqliteEventRepository::new(pool));
    let engine = WorkflowEngine::new(
        Arc::new(FakeSelector::new(agents)),
        dispatcher,
        store.clone(),
        None,
    );
    (engine, store)
}

async fn event_types_in_order(store: &SqliteEventRepository) -> Vec<String> {
    let mut events = store.list(EventFilter::new().limit(100)).await.unwrap();
    events.reverse(); // list returns newest first
    events.into_iter().map(|e| e.event_type).collect()
}

#[tokio::test]
async fn test_two_task_linear_workflow_event_order() {
    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_millis(10)));
    let (engine, store) =
        engine_with(vec![active_agent("a1", &[], 4)], dispatcher.clone()).await;

    let definition = WorkflowDefinition::new("linear")
        .with_task(TaskDescriptor::new("A", "echo hi").delegate_to("a1"))
        .with_task(TaskDescriptor::new("B", "echo bye").delegate_to("a1").depends_on("A"));

    let report = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.all_succeeded());
    assert_eq!(
        event_types_in_order(&store).await,
        vec![
            "workflow.started",
            "task.started",
            "task.completed",
            "task.started",
            "task.completed",
            "workflow.completed",
        ]
    );
    assert_eq!(dispatcher.dispatches(), vec!["a1", "a1"]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_exponential_backoff_succeeds_on_third_attempt() {
    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_millis(1)));
    dispatcher
        .script(
            "flaky",
            vec![
                Outcome::Fail("exit status 1".into()),
                Outcome::Fail("exit status 1".into()),
                Outcome::Ok,
            ],
        )
        .await;
    let (engine, _store) =
        engine_with(vec![active_agent("a1", &[], 4)], dispatcher.clone()).await;

    let definition = WorkflowDefinition::new("retry").with_task(
        TaskDescriptor::new("X", "flaky").delegate_to("a1").with_retry(RetryPolicy {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }),
    );

    let started = tokio::time::Instant::now();
    let report = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.tasks[0].attempts, 3);
    // 1s after the first failure, 2s after the second.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(dispatcher.dispatches().len(), 3);
}

#[tokio::test]
async fn test_cycle_is_policy_violation_before_any_dispatch() {
    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_millis(1)));
    let (engine, store) =
        engine_with(vec![active_agent("a1", &[], 4)], dispatcher.clone()).await;

    let definition = WorkflowDefinition::new("cyclic")
        .with_task(TaskDescriptor::new("A", "x").delegate_to("a1").depends_on("C"))
        .with_task(TaskDescriptor::new("B", "x").delegate_to("a1").depends_on("A"))
        .with_task(TaskDescriptor::new("C", "x").delegate_to("a1").depends_on("B"));

    let err = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(event_types_in_order(&store).await, vec!["workflow.failed"]);
    assert!(dispatcher.dispatches().is_empty());
}

#[tokio::test]
async fn test_unresolvable_selector_is_policy_violation() {
    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_millis(1)));
    let (engine, _store) =
        engine_with(vec![active_agent("a1", &[], 4)], dispatcher.clone()).await;

    let definition =
        WorkflowDefinition::new("ghost").with_task(TaskDescriptor::new("A", "x").delegate_to("ghost"));

    let err = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnresolvedSelector { .. }));
    assert!(dispatcher.dispatches().is_empty());
}

#[tokio::test]
async fn test_single_failure_skips_descendants_without_retry() {
    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_millis(1)));
    dispatcher.script("breaks", vec![Outcome::Fail("exit status 2".into())]).await;
    let (engine, store) =
        engine_with(vec![active_agent("a1", &[], 4)], dispatcher.clone()).await;

    let definition = WorkflowDefinition::new("cascade")
        .with_task(TaskDescriptor::new("A", "breaks").delegate_to("a1"))
        .with_task(TaskDescriptor::new("B", "never").delegate_to("a1").depends_on("A"))
        .with_task(TaskDescriptor::new("C", "never").delegate_to("a1").depends_on("B"));

    let report = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.tasks[0].state, TaskState::Failed);
    assert_eq!(report.tasks[0].attempts, 1);
    assert_eq!(report.tasks[1].state, TaskState::Skipped);
    assert_eq!(report.tasks[2].state, TaskState::Skipped);
    // Only A was ever dispatched.
    assert_eq!(dispatcher.dispatches(), vec!["a1"]);

    let failed = store
        .list(EventFilter::new().event_type("task.failed"))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn test_tag_selection_honors_per_agent_capacity() {
    let dispatcher = Arc::new(
        FakeDispatcher::new(Duration::from_millis(100)).with_capacity(&[("a1", 2), ("a2", 2)]),
    );
    let agents = vec![
        active_agent("a1", &[("role", "web")], 2),
        active_agent("a2", &[("role", "web")], 2),
    ];
    let (engine, _store) = engine_with(agents, dispatcher.clone()).await;

    let mut definition = WorkflowDefinition::new("spread");
    for i in 1..=4 {
        definition = definition.with_task(
            TaskDescriptor::new(format!("T{i}"), "work").delegate_to("role==web"),
        );
    }

    let report = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let dispatches = dispatcher.dispatches();
    assert_eq!(dispatches.len(), 4);
    assert!(dispatcher.peak_for("a1") <= 2);
    assert!(dispatcher.peak_for("a2") <= 2);
}

#[tokio::test]
async fn test_empty_delegate_to_runs_locally() {
    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_millis(1)));
    let (engine, _store) = engine_with(vec![], dispatcher.clone()).await;

    let definition =
        WorkflowDefinition::new("local").with_task(TaskDescriptor::new("A", "echo local"));

    let report = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(dispatcher.local_dispatches.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_buffered_result_accepted_while_running() {
    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_millis(1)));
    dispatcher.script("interrupted", vec![Outcome::DropWithLateSuccess]).await;
    let (engine, _store) =
        engine_with(vec![active_agent("a1", &[], 4)], dispatcher.clone()).await;

    let definition = WorkflowDefinition::new("redelivery").with_task(
        TaskDescriptor::new("A", "interrupted").delegate_to("a1").with_retry(RetryPolicy {
            max_attempts: 2,
            backoff: BackoffKind::Fixed,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }),
    );

    let report = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap();

    // The buffered success from the dropped channel wins; no second
    // dispatch happens.
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(dispatcher.dispatches().len(), 1);
}

#[tokio::test]
async fn test_cancellation_skips_pending_and_ends_cancelled() {
    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_secs(30)));
    let (engine, store) =
        engine_with(vec![active_agent("a1", &[], 4)], dispatcher.clone()).await;

    let definition = WorkflowDefinition::new("cancelme")
        .with_task(TaskDescriptor::new("A", "slow").delegate_to("a1"))
        .with_task(TaskDescriptor::new("B", "never").delegate_to("a1").depends_on("A"));

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let report = engine
        .run(Uuid::new_v4(), definition, cancel, None)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.tasks.iter().all(|t| t.state != TaskState::Succeeded));

    let cancelled_events = store
        .list(EventFilter::new().event_type("workflow.cancelled"))
        .await
        .unwrap();
    assert_eq!(cancelled_events.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_against_unreachable_selector() {
    // No active agents: every attempt fails with agent_unreachable and
    // the task finally fails, skipping its descendants.
    let mut stale = active_agent("a1", &[], 4);
    stale.status = sloth_runner::domain::models::AgentStatus::Unreachable;

    let dispatcher = Arc::new(FakeDispatcher::new(Duration::from_millis(1)));
    let (engine, _store) = engine_with(vec![stale], dispatcher.clone()).await;

    let definition = WorkflowDefinition::new("down")
        .with_task(TaskDescriptor::new("T", "x").delegate_to("a1").with_retry(RetryPolicy {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }))
        .with_task(TaskDescriptor::new("D", "x").delegate_to("a1").depends_on("T"));

    let report = engine
        .run(Uuid::new_v4(), definition, CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.tasks[0].state, TaskState::Failed);
    assert_eq!(report.tasks[0].attempts, 3);
    assert!(report.tasks[0]
        .exit_reason
        .as_deref()
        .unwrap_or("")
        .contains("agent_unreachable"));
    assert_eq!(report.tasks[1].state, TaskState::Skipped);
    assert!(dispatcher.dispatches().is_empty());
}
