//! Master control plane: registry, event store, hook dispatcher, channel
//! map and workflow engine, wired into one explicit struct and served over
//! a single TCP listener.

pub mod channels;
pub mod dispatcher;
pub mod registry;
mod server;

pub use channels::ChannelMap;
pub use dispatcher::ControlPlaneDispatcher;
pub use registry::{AgentRegistry, RegisterOutcome};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::sqlite::{
    SqliteAgentRepository, SqliteEventRepository, SqliteHookRepository, SqliteRunRepository,
};
use crate::agent::executor::{ProcessEvaluator, TaskExecutor};
use crate::domain::models::Config;
use crate::domain::ports::{EventStore, HookRepository, RunRepository};
use crate::services::{HookDispatcher, WorkflowEngine};

/// The authoritative master process state.
///
/// Constructed once at startup; handlers receive it by reference. There is
/// no process-global state.
pub struct Master {
    config: Config,
    pub registry: Arc<AgentRegistry>,
    pub channels: Arc<ChannelMap>,
    pub dispatcher: Arc<ControlPlaneDispatcher>,
    pub engine: Arc<WorkflowEngine>,
    pub events: Arc<dyn EventStore>,
    pub hooks: Arc<dyn HookRepository>,
    pub runs: Arc<dyn RunRepository>,
    hook_dispatcher: Arc<HookDispatcher>,
    active_runs: Mutex<HashMap<Uuid, CancellationToken>>,
    stop_requested: Mutex<HashSet<String>>,
}

impl Master {
    pub fn new(config: Config, pool: SqlitePool) -> Self {
        let events: Arc<dyn EventStore> = Arc::new(SqliteEventRepository::new(pool.clone()));
        let hooks: Arc<dyn HookRepository> = Arc::new(SqliteHookRepository::new(pool.clone()));
        let runs: Arc<dyn RunRepository> = Arc::new(SqliteRunRepository::new(pool.clone()));
        let agent_repo = Arc::new(SqliteAgentRepository::new(pool));

        let registry = Arc::new(AgentRegistry::new(
            agent_repo,
            events.clone(),
            config.heartbeat.clone(),
        ));
        let channels = Arc::new(ChannelMap::new());
        let local_executor = Arc::new(TaskExecutor::new(
            Arc::new(ProcessEvaluator::new(config.agent.interpreter.clone())),
            config.agent.max_parallel_tasks,
        ));
        let dispatcher = Arc::new(ControlPlaneDispatcher::new(
            registry.clone(),
            channels.clone(),
            Some(local_executor),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            registry.clone(),
            dispatcher.clone(),
            events.clone(),
            Some(runs.clone()),
        ));
        let hook_dispatcher = Arc::new(HookDispatcher::new(
            events.clone(),
            hooks.clone(),
            config.hooks.clone(),
        ));

        Self {
            config,
            registry,
            channels,
            dispatcher,
            engine,
            events,
            hooks,
            runs,
            hook_dispatcher,
            active_runs: Mutex::new(HashMap::new()),
            stop_requested: Mutex::new(HashSet::new()),
        }
    }

    /// Serve until the shutdown token fires.
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let loaded = self
            .registry
            .load_persisted()
            .await
            .context("failed to load persisted agents")?;
        if loaded > 0 {
            info!(agents = loaded, "loaded persisted agent records (unreachable until heartbeat)");
        }

        tokio::spawn(self.registry.clone().run_sweeper(shutdown.clone()));
        let hook_handles = self.hook_dispatcher.clone().start(shutdown.clone()).await;

        let addr = self.config.master.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "master listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };
            match accepted {
                Ok((stream, _)) => {
                    let master = self.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server::handle_connection(master, stream, conn_shutdown).await;
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }

        info!("master shutting down");
        for run in self.active_runs.lock().await.values() {
            run.cancel();
        }
        for handle in hook_handles {
            handle.abort();
        }
        Ok(())
    }

    pub(crate) async fn register_run(&self, run_id: Uuid, cancel: CancellationToken) {
        self.active_runs.lock().await.insert(run_id, cancel);
    }

    pub(crate) async fn unregister_run(&self, run_id: Uuid) {
        self.active_runs.lock().await.remove(&run_id);
    }

    pub(crate) async fn cancel_run(&self, run_id: Uuid) -> bool {
        match self.active_runs.lock().await.get(&run_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) async fn mark_stop_requested(&self, name: &str) {
        self.stop_requested.lock().await.insert(name.to_string());
    }

    pub(crate) async fn take_stop_requested(&self, name: &str) -> bool {
        self.stop_requested.lock().await.remove(name)
    }
}
