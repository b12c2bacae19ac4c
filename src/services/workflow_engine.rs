//! Workflow engine: schedules a validated task DAG across agents.
//!
//! The engine owns all task state transitions for a run (they are totally
//! ordered through its completion loop), resolves placement through the
//! `AgentSelector` port and hands execution to the `Dispatcher` port. It
//! never parses scripts.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::event::types as event_types;
use crate::domain::models::{
    AgentStatus, DagError, RunNotice, RunReport, RunStatus, SelectorExpr, TaskDescriptor,
    TaskReport, TaskState, Value, WorkflowDag, WorkflowDefinition,
};
use crate::domain::ports::{
    AgentSelector, DispatchError, DispatchEvent, Dispatcher, EventStore, RunRepository,
    TaskPayload, TaskRunRecord,
};

/// How often a waiting driver re-checks agent capacity.
const CAPACITY_POLL: Duration = Duration::from_millis(100);
/// Master-side slack on top of the agent-enforced task timeout.
const DISPATCH_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow validation failed: {0}")]
    Validation(#[from] DagError),
    #[error("invalid selector for task {task:?}: {error}")]
    Selector { task: String, error: String },
    #[error("selector for task {task:?} matches no registered agent")]
    UnresolvedSelector { task: String },
}

pub struct WorkflowEngine {
    selector: Arc<dyn AgentSelector>,
    dispatcher: Arc<dyn Dispatcher>,
    events: Arc<dyn EventStore>,
    runs: Option<Arc<dyn RunRepository>>,
}

impl WorkflowEngine {
    pub fn new(
        selector: Arc<dyn AgentSelector>,
        dispatcher: Arc<dyn Dispatcher>,
        events: Arc<dyn EventStore>,
        runs: Option<Arc<dyn RunRepository>>,
    ) -> Self {
        Self { selector, dispatcher, events, runs }
    }

    /// Execute a workflow to completion.
    ///
    /// Policy violations (cycles, unknown dependencies, unresolvable
    /// selectors) are fatal before any dispatch; only `workflow.failed` is
    /// emitted for them.
    pub async fn run(
        &self,
        run_id: Uuid,
        definition: WorkflowDefinition,
        cancel: CancellationToken,
        notices: Option<mpsc::Sender<RunNotice>>,
    ) -> Result<RunReport, EngineError> {
        let prepared = match self.validate(&definition).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.emit(
                    event_types::WORKFLOW_FAILED,
                    serde_json::json!({
                        "run_id": run_id,
                        "workflow": definition.name,
                        "reason": e.to_string(),
                    }),
                )
                .await;
                return Err(e);
            }
        };

        let started_at = Utc::now();
        info!(%run_id, workflow = %definition.name, tasks = definition.tasks.len(), "workflow started");
        self.emit(
            event_types::WORKFLOW_STARTED,
            serde_json::json!({ "run_id": run_id, "workflow": definition.name }),
        )
        .await;
        if let Some(runs) = &self.runs {
            if let Err(e) = runs.create_run(run_id, &definition.name, started_at).await {
                warn!(%run_id, error = %e, "failed to persist run");
            }
        }
        notify(
            &notices,
            RunNotice::RunStarted { run_id, workflow_name: definition.name.clone() },
        )
        .await;

        let report = self
            .schedule(run_id, &definition, prepared, started_at, cancel, &notices)
            .await;

        let (event_type, payload) = match report.status {
            RunStatus::Completed => (
                event_types::WORKFLOW_COMPLETED,
                serde_json::json!({ "run_id": run_id, "workflow": definition.name }),
            ),
            RunStatus::Cancelled => (
                event_types::WORKFLOW_CANCELLED,
                serde_json::json!({ "run_id": run_id, "workflow": definition.name }),
            ),
            _ => (
                event_types::WORKFLOW_FAILED,
                serde_json::json!({ "run_id": run_id, "workflow": definition.name }),
            ),
        };
        self.emit(event_type, payload).await;
        if let Some(runs) = &self.runs {
            if let Err(e) = runs.finish_run(run_id, report.status, report.finished_at).await {
                warn!(%run_id, error = %e, "failed to persist run completion");
            }
        }
        notify(&notices, RunNotice::RunFinished { status: report.status }).await;

        Ok(report)
    }

    async fn validate(&self, definition: &WorkflowDefinition) -> Result<Prepared, EngineError> {
        let dag = WorkflowDag::build(&definition.tasks)?;

        let mut selectors = HashMap::new();
        for task in &definition.tasks {
            let expr = SelectorExpr::parse(&task.delegate_to).map_err(|e| {
                EngineError::Selector { task: task.id.clone(), error: e.to_string() }
            })?;
            if !expr.is_local() {
                let candidates = self
                    .selector
                    .select(&expr)
                    .await
                    .map_err(|e| EngineError::Selector { task: task.id.clone(), error: e.to_string() })?;
                if candidates.is_empty() {
                    return Err(EngineError::UnresolvedSelector { task: task.id.clone() });
                }
            }
            selectors.insert(task.id.clone(), expr);
        }

        Ok(Prepared { dag, selectors })
    }

    #[allow(clippy::too_many_lines)]
    async fn schedule(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
        prepared: Prepared,
        started_at: DateTime<Utc>,
        cancel: CancellationToken,
        notices: &Option<mpsc::Sender<RunNotice>>,
    ) -> RunReport {
        let Prepared { dag, selectors } = prepared;
        let run_token = cancel.child_token();

        let mut states: HashMap<String, TaskState> =
            dag.order().iter().map(|id| (id.clone(), TaskState::Pending)).collect();
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut reports: HashMap<String, TaskReport> = HashMap::new();

        let mut ready: VecDeque<String> = dag.roots().into();
        for id in &ready {
            states.insert(id.clone(), TaskState::Ready);
        }

        let (done_tx, mut done_rx) = mpsc::channel::<TaskOutcome>(64);
        let mut in_flight = 0usize;
        let mut cancelled = false;

        let deadline = definition.timeout().map(|t| tokio::time::Instant::now() + t);

        loop {
            // Launch everything currently ready.
            while let Some(task_id) = ready.pop_front() {
                if cancelled {
                    states.insert(task_id, TaskState::Skipped);
                    continue;
                }
                let Some(task) = definition.task(&task_id) else { continue };
                let Some(expr) = selectors.get(&task_id) else { continue };

                states.insert(task_id.clone(), TaskState::Running);
                notify(
                    notices,
                    RunNotice::TaskStateChanged {
                        task_id: task_id.clone(),
                        state: TaskState::Running,
                        agent: None,
                    },
                )
                .await;

                let deps: BTreeMap<String, Value> = task
                    .depends_on
                    .iter()
                    .filter_map(|dep| outputs.get(dep).map(|v| (dep.clone(), v.clone())))
                    .collect();

                let driver = TaskDriver {
                    run_id,
                    task: task.clone(),
                    expr: expr.clone(),
                    deps,
                    selector: self.selector.clone(),
                    dispatcher: self.dispatcher.clone(),
                    events: self.events.clone(),
                    runs: self.runs.clone(),
                    notices: notices.clone(),
                    cancel: run_token.child_token(),
                };
                let tx = done_tx.clone();
                in_flight += 1;
                tokio::spawn(async move {
                    let outcome = driver.run().await;
                    let _ = tx.send(outcome).await;
                });
            }

            if in_flight == 0 {
                break;
            }

            let outcome = tokio::select! {
                Some(outcome) = done_rx.recv() => outcome,
                _ = cancel.cancelled(), if !cancelled => {
                    info!(%run_id, "cancellation requested");
                    cancelled = true;
                    run_token.cancel();
                    continue;
                }
                _ = sleep_until(deadline), if deadline.is_some() && !cancelled => {
                    warn!(%run_id, "workflow timeout elapsed, cancelling running tasks");
                    cancelled = true;
                    run_token.cancel();
                    continue;
                }
            };
            in_flight -= 1;

            let task_id = outcome.task_id.clone();
            match outcome.result {
                DriverResult::Succeeded { agent, attempts, output, duration_ms } => {
                    states.insert(task_id.clone(), TaskState::Succeeded);
                    succeeded.insert(task_id.clone());
                    outputs.insert(task_id.clone(), output.unwrap_or(Value::Null));
                    reports.insert(
                        task_id.clone(),
                        TaskReport {
                            task_id: task_id.clone(),
                            state: TaskState::Succeeded,
                            agent: agent.clone(),
                            attempts,
                            exit_reason: None,
                            duration_ms,
                        },
                    );
                    notify(
                        notices,
                        RunNotice::TaskStateChanged {
                            task_id: task_id.clone(),
                            state: TaskState::Succeeded,
                            agent,
                        },
                    )
                    .await;

                    if !cancelled {
                        for next in dag.newly_ready(&task_id, &succeeded) {
                            if states.get(&next) == Some(&TaskState::Pending) {
                                states.insert(next.clone(), TaskState::Ready);
                                ready.push_back(next);
                            }
                        }
                    }
                }
                DriverResult::Failed { agent, attempts, reason, duration_ms } => {
                    states.insert(task_id.clone(), TaskState::Failed);
                    reports.insert(
                        task_id.clone(),
                        TaskReport {
                            task_id: task_id.clone(),
                            state: TaskState::Failed,
                            agent: agent.clone(),
                            attempts,
                            exit_reason: Some(reason.clone()),
                            duration_ms,
                        },
                    );
                    notify(
                        notices,
                        RunNotice::TaskStateChanged {
                            task_id: task_id.clone(),
                            state: TaskState::Failed,
                            agent,
                        },
                    )
                    .await;

                    // Everything downstream of an exhausted failure skips.
                    for dep in dag.all_dependents(&task_id) {
                        if states.get(&dep).is_some_and(|s| !s.is_terminal())
                            && states.get(&dep) != Some(&TaskState::Running)
                        {
                            states.insert(dep.clone(), TaskState::Skipped);
                            notify(
                                notices,
                                RunNotice::TaskStateChanged {
                                    task_id: dep,
                                    state: TaskState::Skipped,
                                    agent: None,
                                },
                            )
                            .await;
                        }
                    }
                }
                DriverResult::Cancelled { attempts } => {
                    states.insert(task_id.clone(), TaskState::Skipped);
                    reports.insert(
                        task_id.clone(),
                        TaskReport {
                            task_id: task_id.clone(),
                            state: TaskState::Skipped,
                            agent: None,
                            attempts,
                            exit_reason: Some("cancelled".to_string()),
                            duration_ms: 0,
                        },
                    );
                }
            }
        }

        // Whatever never ran is skipped.
        for (task_id, state) in &mut states {
            if !state.is_terminal() {
                *state = TaskState::Skipped;
                notify(
                    notices,
                    RunNotice::TaskStateChanged {
                        task_id: task_id.clone(),
                        state: TaskState::Skipped,
                        agent: None,
                    },
                )
                .await;
            }
        }

        let status = if cancelled && deadline.map_or(true, |d| tokio::time::Instant::now() < d) {
            RunStatus::Cancelled
        } else if states.values().all(|s| *s == TaskState::Succeeded) {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let tasks = dag
            .order()
            .iter()
            .map(|id| {
                reports.remove(id).unwrap_or_else(|| TaskReport {
                    task_id: id.clone(),
                    state: *states.get(id).unwrap_or(&TaskState::Skipped),
                    agent: None,
                    attempts: 0,
                    exit_reason: None,
                    duration_ms: 0,
                })
            })
            .collect();

        RunReport {
            run_id,
            workflow_name: definition.name.clone(),
            status,
            tasks,
            outputs,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(e) = self.events.append(event_type, payload).await {
            warn!(event_type, error = %e, "failed to append workflow event");
        }
    }
}

struct Prepared {
    dag: WorkflowDag,
    selectors: HashMap<String, SelectorExpr>,
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn notify(notices: &Option<mpsc::Sender<RunNotice>>, notice: RunNotice) {
    if let Some(tx) = notices {
        let _ = tx.send(notice).await;
    }
}

struct TaskOutcome {
    task_id: String,
    result: DriverResult,
}

enum DriverResult {
    Succeeded { agent: Option<String>, attempts: u32, output: Option<Value>, duration_ms: u64 },
    Failed { agent: Option<String>, attempts: u32, reason: String, duration_ms: u64 },
    Cancelled { attempts: u32 },
}

/// Drives one task through placement, dispatch and retries.
struct TaskDriver {
    run_id: Uuid,
    task: TaskDescriptor,
    expr: SelectorExpr,
    deps: BTreeMap<String, Value>,
    selector: Arc<dyn AgentSelector>,
    dispatcher: Arc<dyn Dispatcher>,
    events: Arc<dyn EventStore>,
    runs: Option<Arc<dyn RunRepository>>,
    notices: Option<mpsc::Sender<RunNotice>>,
    cancel: CancellationToken,
}

enum AttemptResult {
    Succeeded { output: Option<Value> },
    Failed { reason: String },
    Cancelled,
}

impl TaskDriver {
    #[allow(clippy::too_many_lines)]
    async fn run(self) -> TaskOutcome {
        let started = std::time::Instant::now();
        let mut attempt = 0u32;
        let mut pinned_agent: Option<String> = None;
        let mut last_reason = String::from("no attempts made");
        let mut last_task_run_id: Option<Uuid> = None;
        let mut started_event_sent = false;

        while attempt < self.task.retry.max_attempts.max(1) {
            attempt += 1;

            // A result buffered on the agent across a channel drop beats a
            // fresh attempt, but only while we are still running.
            if let Some(prev) = last_task_run_id {
                if let Some(late) = self.dispatcher.take_late_result(prev).await {
                    if late.success {
                        self.record(pinned_agent.clone(), TaskState::Succeeded, attempt - 1, None, prev)
                            .await;
                        return TaskOutcome {
                            task_id: self.task.id.clone(),
                            result: DriverResult::Succeeded {
                                agent: pinned_agent,
                                attempts: attempt - 1,
                                output: late.output_blob,
                                duration_ms: started.elapsed().as_millis() as u64,
                            },
                        };
                    }
                }
            }

            let targets = match self.resolve(&mut pinned_agent).await {
                Ok(targets) => targets,
                Err(reason) => {
                    last_reason = reason;
                    if attempt < self.task.retry.max_attempts {
                        if self.backoff(attempt).await.is_err() {
                            return self.cancelled_outcome(attempt);
                        }
                    }
                    continue;
                }
            };

            let task_run_id = Uuid::new_v4();
            last_task_run_id = Some(task_run_id);

            if !started_event_sent {
                started_event_sent = true;
                self.emit(
                    event_types::TASK_STARTED,
                    serde_json::json!({
                        "run_id": self.run_id,
                        "task_id": self.task.id,
                        "task": self.task.name,
                        "agent": targets.first(),
                    }),
                )
                .await;
            }
            self.record(targets.first().cloned(), TaskState::Running, attempt, None, task_run_id)
                .await;

            let result = self.attempt_once(task_run_id, &targets).await;
            match result {
                AttemptResult::Succeeded { output } => {
                    let agent = targets.first().cloned();
                    self.emit(
                        event_types::TASK_COMPLETED,
                        serde_json::json!({
                            "run_id": self.run_id,
                            "task_id": self.task.id,
                            "task": self.task.name,
                            "agent": agent,
                            "attempts": attempt,
                        }),
                    )
                    .await;
                    self.record(agent.clone(), TaskState::Succeeded, attempt, None, task_run_id)
                        .await;
                    return TaskOutcome {
                        task_id: self.task.id.clone(),
                        result: DriverResult::Succeeded {
                            agent,
                            attempts: attempt,
                            output,
                            duration_ms: started.elapsed().as_millis() as u64,
                        },
                    };
                }
                AttemptResult::Failed { reason } => {
                    debug!(task = %self.task.id, attempt, %reason, "task attempt failed");
                    last_reason = reason;
                    if attempt < self.task.retry.max_attempts {
                        if self.backoff(attempt).await.is_err() {
                            return self.cancelled_outcome(attempt);
                        }
                    }
                }
                AttemptResult::Cancelled => return self.cancelled_outcome(attempt),
            }
        }

        let agent = pinned_agent.clone();
        self.emit(
            event_types::TASK_FAILED,
            serde_json::json!({
                "run_id": self.run_id,
                "task_id": self.task.id,
                "task": self.task.name,
                "agent": agent,
                "attempts": attempt,
                "reason": last_reason,
            }),
        )
        .await;
        if let Some(task_run_id) = last_task_run_id {
            self.record(agent.clone(), TaskState::Failed, attempt, Some(last_reason.clone()), task_run_id)
                .await;
        }
        TaskOutcome {
            task_id: self.task.id.clone(),
            result: DriverResult::Failed {
                agent,
                attempts: attempt,
                reason: last_reason,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    /// Resolve the selector to dispatch targets for this attempt.
    ///
    /// Retries stick to the same agent unless it stopped being Active;
    /// ties break lexicographically among Active candidates. An empty
    /// vec means local execution.
    async fn resolve(&self, pinned: &mut Option<String>) -> Result<Vec<String>, String> {
        if self.expr.is_local() {
            return Ok(Vec::new());
        }

        let candidates = self
            .selector
            .select(&self.expr)
            .await
            .map_err(|e| format!("selector error: {e}"))?;

        if let Some(pin) = pinned.clone() {
            let still_active = candidates
                .iter()
                .any(|r| r.name == pin && r.status == AgentStatus::Active);
            if still_active {
                self.wait_for_capacity(&pin, &candidates).await?;
                return Ok(vec![pin]);
            }
            *pinned = None;
        }

        let active: Vec<_> = candidates
            .iter()
            .filter(|r| r.status == AgentStatus::Active)
            .collect();
        if active.is_empty() {
            return Err("agent_unreachable: no active agent matches selector".to_string());
        }

        if self.task.fanout {
            let names: Vec<String> = active.iter().map(|r| r.name.clone()).collect();
            for name in &names {
                self.wait_for_capacity(name, &candidates).await?;
            }
            return Ok(names);
        }

        // Lexicographic first with a free slot; candidates are sorted.
        loop {
            for record in &active {
                let free = record.max_parallel_tasks as usize
                    > self.dispatcher.in_flight(&record.name);
                if free {
                    *pinned = Some(record.name.clone());
                    return Ok(vec![record.name.clone()]);
                }
            }
            if self.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            tokio::time::sleep(CAPACITY_POLL).await;
        }
    }

    async fn wait_for_capacity(
        &self,
        name: &str,
        candidates: &[crate::domain::models::AgentRecord],
    ) -> Result<(), String> {
        let Some(record) = candidates.iter().find(|r| r.name == name) else {
            return Err(format!("agent_unknown: {name}"));
        };
        loop {
            if self.dispatcher.in_flight(name) < record.max_parallel_tasks as usize {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            tokio::time::sleep(CAPACITY_POLL).await;
        }
    }

    /// One dispatch round: a single agent, the master itself, or a fanout
    /// broadcast (which succeeds only when every replica succeeds).
    async fn attempt_once(&self, task_run_id: Uuid, targets: &[String]) -> AttemptResult {
        if targets.is_empty() {
            return self.dispatch_and_consume(task_run_id, None).await;
        }
        if targets.len() == 1 {
            return self.dispatch_and_consume(task_run_id, Some(targets[0].as_str())).await;
        }

        // Each replica gets its own run id; the first keeps the attempt's
        // id so late results stay addressable.
        let replicas: Vec<(String, Uuid)> = targets
            .iter()
            .enumerate()
            .map(|(i, agent)| {
                (agent.clone(), if i == 0 { task_run_id } else { Uuid::new_v4() })
            })
            .collect();

        let attempts = replicas
            .iter()
            .map(|(agent, replica_id)| self.dispatch_and_consume(*replica_id, Some(agent.as_str())));
        let results = futures::future::join_all(attempts).await;

        for result in results {
            match result {
                AttemptResult::Succeeded { .. } => {}
                other => return other,
            }
        }
        AttemptResult::Succeeded { output: None }
    }

    async fn dispatch_and_consume(&self, task_run_id: Uuid, agent: Option<&str>) -> AttemptResult {
        let payload = TaskPayload {
            task_run_id,
            script_source: self.task.script_source.clone(),
            params: self.params_with_deps(),
            env: self.task.env.clone(),
            timeout_ms: self.task.timeout.as_millis() as u64,
            workflow_run_id: Some(self.run_id),
        };

        let attempt_cancel = self.cancel.child_token();
        let mut rx = loop {
            let dispatched = match agent {
                Some(agent) => {
                    self.dispatcher.dispatch(agent, payload.clone(), attempt_cancel.clone()).await
                }
                None => self.dispatcher.dispatch_local(payload.clone(), attempt_cancel.clone()).await,
            };
            match dispatched {
                Ok(rx) => break rx,
                Err(DispatchError::AgentBusy(_)) => {
                    // Raced another dispatch into the last slot; wait it
                    // out instead of burning a retry attempt.
                    if self.cancel.is_cancelled() {
                        return AttemptResult::Cancelled;
                    }
                    tokio::time::sleep(CAPACITY_POLL).await;
                }
                Err(e) => return AttemptResult::Failed { reason: e.to_string() },
            }
        };

        let deadline = tokio::time::Instant::now() + self.task.timeout + DISPATCH_GRACE;
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = tokio::time::sleep_until(deadline) => {
                    attempt_cancel.cancel();
                    return AttemptResult::Failed { reason: "timeout".to_string() };
                }
                _ = self.cancel.cancelled() => {
                    attempt_cancel.cancel();
                    return AttemptResult::Cancelled;
                }
            };

            match event {
                Some(DispatchEvent::Chunk(chunk)) => {
                    if let Some(tx) = &self.notices {
                        let line = String::from_utf8_lossy(&chunk.data).trim_end().to_string();
                        let _ = tx
                            .send(RunNotice::TaskOutput {
                                task_id: self.task.id.clone(),
                                kind: chunk.kind.as_str().to_string(),
                                line,
                            })
                            .await;
                    }
                }
                Some(DispatchEvent::Custom { event_type, payload }) => {
                    self.emit(&event_type, payload).await;
                }
                Some(DispatchEvent::Done(status)) => {
                    if status.success {
                        return AttemptResult::Succeeded { output: status.output_blob };
                    }
                    return AttemptResult::Failed { reason: status.exit_reason };
                }
                None => {
                    return AttemptResult::Failed {
                        reason: "agent_unreachable: channel dropped mid-stream".to_string(),
                    };
                }
            }
        }
    }

    fn params_with_deps(&self) -> BTreeMap<String, Value> {
        let mut params = self.task.params.clone();
        if !self.deps.is_empty() {
            params.insert("deps".to_string(), Value::Map(self.deps.clone()));
        }
        params
    }

    /// Sleep out the retry backoff; errors if cancelled meanwhile.
    async fn backoff(&self, failed_attempt: u32) -> Result<(), ()> {
        let delay = self.task.retry.delay_after(failed_attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(()),
        }
    }

    fn cancelled_outcome(&self, attempts: u32) -> TaskOutcome {
        TaskOutcome {
            task_id: self.task.id.clone(),
            result: DriverResult::Cancelled { attempts },
        }
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(e) = self.events.append(event_type, payload).await {
            warn!(event_type, error = %e, "failed to append task event");
        }
    }

    async fn record(
        &self,
        agent: Option<String>,
        state: TaskState,
        attempts: u32,
        exit_reason: Option<String>,
        task_run_id: Uuid,
    ) {
        let Some(runs) = &self.runs else { return };
        let now = Utc::now();
        let record = TaskRunRecord {
            task_run_id,
            run_id: self.run_id,
            task_id: self.task.id.clone(),
            task_name: self.task.name.clone(),
            agent_name: agent,
            state,
            attempts,
            exit_reason,
            started_at: Some(now),
            finished_at: state.is_terminal().then_some(now),
        };
        if let Err(e) = runs.upsert_task_run(&record).await {
            warn!(task = %self.task.id, error = %e, "failed to persist task run");
        }
    }
}

