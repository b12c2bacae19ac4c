//! Shared test doubles for engine and control-plane tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sloth_runner::domain::models::{AgentRecord, AgentStatus, SelectorExpr};
use sloth_runner::domain::ports::{
    AgentSelector, DispatchError, DispatchEvent, Dispatcher, FinalStatus, RegistryError,
    TaskPayload,
};

/// Static selector over a fixed agent set.
pub struct FakeSelector {
    pub agents: Vec<AgentRecord>,
}

impl FakeSelector {
    pub fn new(agents: Vec<AgentRecord>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl AgentSelector for FakeSelector {
    async fn select(&self, expr: &SelectorExpr) -> Result<Vec<AgentRecord>, RegistryError> {
        let mut matched: Vec<AgentRecord> = self
            .agents
            .iter()
            .filter(|r| expr.matches(&r.name, &r.tags))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matched)
    }
}

pub fn active_agent(name: &str, tags: &[(&str, &str)], max_parallel: u32) -> AgentRecord {
    let mut record = AgentRecord::new(name, "127.0.0.1:0");
    record.status = AgentStatus::Active;
    record.max_parallel_tasks = max_parallel;
    record.tags = tags.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
    record
}

/// Scripted per-dispatch behavior, keyed by the task's script source.
#[derive(Clone)]
pub enum Outcome {
    /// Terminal success after the hold time.
    Ok,
    /// Terminal failure with this exit reason.
    Fail(String),
    /// Channel closes without a terminal status.
    Drop,
    /// Channel closes, but a successful buffered result shows up as a
    /// late delivery for the same task run id.
    DropWithLateSuccess,
}

/// In-memory dispatcher with scripted outcomes and real in-flight
/// accounting.
pub struct FakeDispatcher {
    outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
    pub dispatch_log: StdMutex<Vec<String>>,
    in_flight: Arc<StdMutex<HashMap<String, usize>>>,
    peak_in_flight: Arc<StdMutex<HashMap<String, usize>>>,
    late: Arc<Mutex<HashMap<Uuid, FinalStatus>>>,
    capacities: HashMap<String, usize>,
    hold: Duration,
    pub local_dispatches: AtomicUsize,
}

impl FakeDispatcher {
    pub fn new(hold: Duration) -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            dispatch_log: StdMutex::new(Vec::new()),
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
            peak_in_flight: Arc::new(StdMutex::new(HashMap::new())),
            late: Arc::new(Mutex::new(HashMap::new())),
            capacities: HashMap::new(),
            hold,
            local_dispatches: AtomicUsize::new(0),
        }
    }

    /// Enforce per-agent slots like the real control plane: a dispatch
    /// over capacity returns `AgentBusy`.
    pub fn with_capacity(mut self, caps: &[(&str, usize)]) -> Self {
        self.capacities = caps.iter().map(|(k, v)| ((*k).to_string(), *v)).collect();
        self
    }

    /// Queue scripted outcomes for dispatches of the given script source.
    /// Unscripted dispatches succeed.
    pub async fn script(&self, script_source: &str, outcomes: Vec<Outcome>) {
        self.outcomes
            .lock()
            .await
            .insert(script_source.to_string(), outcomes.into());
    }

    pub fn dispatches(&self) -> Vec<String> {
        self.dispatch_log.lock().expect("poisoned").clone()
    }

    pub fn peak_for(&self, agent: &str) -> usize {
        self.peak_in_flight
            .lock()
            .expect("poisoned")
            .get(agent)
            .copied()
            .unwrap_or(0)
    }

    async fn next_outcome(&self, script: &str) -> Outcome {
        self.outcomes
            .lock()
            .await
            .get_mut(script)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Ok)
    }

    async fn run_dispatch(&self, agent_key: String, payload: TaskPayload) -> mpsc::Receiver<DispatchEvent> {
        let (tx, rx) = mpsc::channel(16);
        let outcome = self.next_outcome(&payload.script_source).await;
        let hold = self.hold;
        let in_flight = self.in_flight.clone();
        let late = self.late.clone();
        let task_run_id = payload.task_run_id;

        {
            let mut map = in_flight.lock().expect("poisoned");
            let count = map.entry(agent_key.clone()).or_insert(0);
            *count += 1;
            let mut peaks = self.peak_in_flight.lock().expect("poisoned");
            let peak = peaks.entry(agent_key.clone()).or_insert(0);
            *peak = (*peak).max(*count);
        }

        tokio::spawn(async move {
            tokio::time::sleep(hold).await;

            match outcome {
                Outcome::Ok => {
                    let _ = tx
                        .send(DispatchEvent::Done(FinalStatus {
                            task_run_id,
                            success: true,
                            exit_reason: "ok".to_string(),
                            output_blob: None,
                            duration_ms: hold.as_millis() as u64,
                        }))
                        .await;
                }
                Outcome::Fail(reason) => {
                    let _ = tx
                        .send(DispatchEvent::Done(FinalStatus {
                            task_run_id,
                            success: false,
                            exit_reason: reason,
                            output_blob: None,
                            duration_ms: hold.as_millis() as u64,
                        }))
                        .await;
                }
                Outcome::Drop => drop(tx),
                Outcome::DropWithLateSuccess => {
                    late.lock().await.insert(
                        task_run_id,
                        FinalStatus {
                            task_run_id,
                            success: true,
                            exit_reason: "ok".to_string(),
                            output_blob: None,
                            duration_ms: hold.as_millis() as u64,
                        },
                    );
                    drop(tx);
                }
            }

            if let Ok(mut map) = in_flight.lock() {
                if let Some(count) = map.get_mut(&agent_key) {
                    *count = count.saturating_sub(1);
                }
            }
        });

        rx
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn dispatch(
        &self,
        agent: &str,
        payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DispatchEvent>, DispatchError> {
        if let Some(cap) = self.capacities.get(agent) {
            if self.in_flight(agent) >= *cap {
                return Err(DispatchError::AgentBusy(agent.to_string()));
            }
        }
        self.dispatch_log.lock().expect("poisoned").push(agent.to_string());
        Ok(self.run_dispatch(agent.to_string(), payload).await)
    }

    async fn dispatch_local(
        &self,
        payload: TaskPayload,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DispatchEvent>, DispatchError> {
        self.local_dispatches.fetch_add(1, Ordering::SeqCst);
        self.dispatch_log.lock().expect("poisoned").push("local".to_string());
        Ok(self.run_dispatch("local".to_string(), payload).await)
    }

    fn in_flight(&self, agent: &str) -> usize {
        self.in_flight
            .lock()
            .map(|m| m.get(agent).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    async fn take_late_result(&self, task_run_id: Uuid) -> Option<FinalStatus> {
        self.late.lock().await.remove(&task_run_id)
    }
}
