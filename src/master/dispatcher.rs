//! Control-plane dispatcher: forwards task payloads to agents over their
//! control channels and relays the streamed results.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::agent::executor::TaskExecutor;
use crate::domain::models::AgentStatus;
use crate::domain::ports::{
    DispatchError, DispatchEvent, Dispatcher, EvalJob, FinalStatus, ShellPayload, TaskPayload,
};
use crate::protocol::MasterFrame;

use super::channels::ChannelMap;
use super::registry::AgentRegistry;

pub struct ControlPlaneDispatcher {
    registry: Arc<AgentRegistry>,
    channels: Arc<ChannelMap>,
    /// Executor for tasks with no `delegate_to` (run on the master host).
    local: Option<Arc<TaskExecutor>>,
}

impl ControlPlaneDispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        channels: Arc<ChannelMap>,
        local: Option<Arc<TaskExecutor>>,
    ) -> Self {
        Self { registry, channels, local }
    }

    /// Preconditions shared by task and shell dispatch: the agent must be
    /// registered, Active, and hold a live channel.
    async fn check_reachable(&self, agent: &str) -> Result<(), DispatchError> {
        let record = self
            .registry
            .lookup(agent)
            .await
            .ok_or_else(|| DispatchError::AgentUnknown(agent.to_string()))?;
        if record.status != AgentStatus::Active {
            return Err(DispatchError::AgentUnreachable(agent.to_string()));
        }
        if !self.channels.is_attached(agent).await {
            return Err(DispatchError::AgentUnreachable(agent.to_string()));
        }
        if self.channels.in_flight(agent) >= record.max_parallel_tasks as usize {
            return Err(DispatchError::AgentBusy(agent.to_string()));
        }
        Ok(())
    }

    async fn send_over_channel(
        &self,
        agent: &str,
        task_run_id: Uuid,
        frame: MasterFrame,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DispatchEvent>, DispatchError> {
        let rx = self.channels.open_stream(agent, task_run_id).await;
        if !self.channels.send(agent, frame).await {
            self.channels.abort_stream(task_run_id).await;
            return Err(DispatchError::AgentUnreachable(agent.to_string()));
        }

        // Propagate caller-side cancellation to the agent; the stream
        // still terminates through the agent's own "cancelled" status.
        let channels = self.channels.clone();
        let agent = agent.to_string();
        tokio::spawn(async move {
            cancel.cancelled().await;
            debug!(%task_run_id, agent = %agent, "propagating cancel to agent");
            let _ = channels.send(&agent, MasterFrame::CancelTask { task_run_id }).await;
        });

        Ok(rx)
    }

    /// Master-side `AgentRun`: ad-hoc shell execution on a named agent.
    pub async fn dispatch_shell(
        &self,
        agent: &str,
        payload: ShellPayload,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DispatchEvent>, DispatchError> {
        self.check_reachable(agent).await?;
        self.send_over_channel(agent, payload.task_run_id, MasterFrame::RunShell(payload), cancel)
            .await
    }
}

#[async_trait]
impl Dispatcher for ControlPlaneDispatcher {
    async fn dispatch(
        &self,
        agent: &str,
        payload: TaskPayload,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DispatchEvent>, DispatchError> {
        self.check_reachable(agent).await?;
        self.send_over_channel(
            agent,
            payload.task_run_id,
            MasterFrame::DispatchTask(payload),
            cancel,
        )
        .await
    }

    async fn dispatch_local(
        &self,
        payload: TaskPayload,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DispatchEvent>, DispatchError> {
        let executor = self.local.as_ref().ok_or(DispatchError::LocalUnavailable)?;
        let job = EvalJob {
            task_run_id: payload.task_run_id,
            script_source: payload.script_source,
            params: payload.params,
            env: merged_env(payload.env, payload.workflow_run_id),
            timeout: std::time::Duration::from_millis(payload.timeout_ms),
        };
        Ok(executor.execute(job, cancel).await)
    }

    fn in_flight(&self, agent: &str) -> usize {
        self.channels.in_flight(agent)
    }

    async fn take_late_result(&self, task_run_id: Uuid) -> Option<FinalStatus> {
        self.channels.take_late_result(task_run_id).await
    }
}

fn merged_env(
    mut env: BTreeMap<String, String>,
    workflow_run_id: Option<Uuid>,
) -> BTreeMap<String, String> {
    if let Some(run_id) = workflow_run_id {
        env.insert("SLOTH_WORKFLOW_RUN_ID".to_string(), run_id.to_string());
    }
    env
}
