//! Agent runtime: a long-running worker process holding one control
//! channel to the master.
//!
//! The agent dials the master, registers, heartbeats, executes dispatched
//! tasks and streams results back. A network drop never aborts running
//! tasks: terminal statuses that cannot be delivered are buffered by
//! `task_run_id` and re-delivered after reconnect.

pub mod executor;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{AgentConfig, HeartbeatConfig};
use crate::domain::ports::{DispatchEvent, EvalJob, FinalStatus, ShellPayload, TaskPayload};
use crate::protocol::{
    read_frame, write_frame, AgentFrame, Hello, MasterFrame, ProbeReply, ProbeRequest,
    ProtocolError, RegisterReply, RegisterRequest,
};

use executor::{ProcessEvaluator, TaskExecutor};

const OUTBOUND_DEPTH: usize = 256;

/// Identity and connectivity for one agent process.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub name: String,
    pub master_addr: String,
    /// host:port the master may probe back.
    pub advertise_addr: String,
    pub report_address: Option<String>,
    pub tags: BTreeMap<String, String>,
}

enum SessionEnd {
    /// The master asked us to shut down; in-flight tasks were drained.
    Shutdown,
    /// The channel dropped or registration failed; reconnect.
    Disconnected,
}

pub struct AgentRuntime {
    options: AgentOptions,
    config: AgentConfig,
    heartbeat: HeartbeatConfig,
    executor: Arc<TaskExecutor>,
    /// Undelivered terminal statuses, keyed by task run id.
    buffered: Arc<Mutex<HashMap<Uuid, FinalStatus>>>,
    /// Cancels running evaluators on process shutdown.
    kill_tasks: CancellationToken,
}

impl AgentRuntime {
    pub fn new(options: AgentOptions, config: AgentConfig, heartbeat: HeartbeatConfig) -> Self {
        let executor = Arc::new(TaskExecutor::new(
            Arc::new(ProcessEvaluator::new(config.interpreter.clone())),
            config.max_parallel_tasks,
        ));
        Self {
            options,
            config,
            heartbeat,
            executor,
            buffered: Arc::new(Mutex::new(HashMap::new())),
            kill_tasks: CancellationToken::new(),
        }
    }

    /// Run until shut down by the master or the given token.
    ///
    /// Reconnects with exponential backoff (1s..60s, ±20% jitter) whenever
    /// the control channel drops.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let probe = self.clone();
        let probe_cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = probe.serve_probes(probe_cancel).await {
                warn!(error = %e, "diagnostic listener failed");
            }
        });

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            randomization_factor: 0.2,
            multiplier: 2.0,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            match self.session(&mut backoff, &shutdown).await {
                SessionEnd::Shutdown => {
                    info!("agent shut down gracefully");
                    return Ok(());
                }
                SessionEnd::Disconnected => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    debug!(?delay, "reconnecting to master");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => return Ok(()),
                    }
                }
            }
        }
    }

    /// One connected session: register, redeliver, heartbeat, serve frames.
    async fn session(
        self: &Arc<Self>,
        backoff: &mut ExponentialBackoff,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let stream = match TcpStream::connect(&self.options.master_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(master = %self.options.master_addr, error = %e, "connect failed");
                return SessionEnd::Disconnected;
            }
        };
        let (mut reader, mut writer) = tokio::io::split(stream);

        let request = RegisterRequest {
            name: self.options.name.clone(),
            address: self.options.advertise_addr.clone(),
            report_address: self.options.report_address.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tags: self.options.tags.clone(),
            system_info: system_info(),
            max_parallel_tasks: self.config.max_parallel_tasks,
        };
        if write_frame(&mut writer, &Hello::Agent(request)).await.is_err() {
            return SessionEnd::Disconnected;
        }
        match read_frame::<_, RegisterReply>(&mut reader).await {
            Ok(RegisterReply::Accepted) => {}
            Ok(RegisterReply::Rejected { reason }) => {
                warn!(%reason, "master rejected registration");
                return SessionEnd::Disconnected;
            }
            Err(_) => return SessionEnd::Disconnected,
        }
        info!(master = %self.options.master_addr, "registered with master");
        backoff.reset();

        let (outbound, mut outbound_rx) = mpsc::channel::<AgentFrame>(OUTBOUND_DEPTH);
        let session_cancel = CancellationToken::new();

        let writer_cancel = session_cancel.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = outbound_rx.recv() => frame,
                    _ = writer_cancel.cancelled() => None,
                };
                let Some(frame) = frame else { break };
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        self.redeliver_buffered(&outbound).await;

        let hb_outbound = outbound.clone();
        let hb_name = self.options.name.clone();
        let hb_interval = self.heartbeat.interval();
        let hb_cancel = session_cancel.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hb_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let frame = AgentFrame::Heartbeat {
                            name: hb_name.clone(),
                            system_info: system_info(),
                        };
                        if hb_outbound.send(frame).await.is_err() {
                            return;
                        }
                    }
                    _ = hb_cancel.cancelled() => return,
                }
            }
        });

        let end = loop {
            let frame: Result<MasterFrame, ProtocolError> = tokio::select! {
                frame = read_frame(&mut reader) => frame,
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(ProtocolError::ConnectionClosed) => break SessionEnd::Disconnected,
                Err(e) => {
                    warn!(error = %e, "control channel error");
                    break SessionEnd::Disconnected;
                }
            };

            match frame {
                MasterFrame::DispatchTask(payload) => {
                    self.spawn_task(task_job(payload), outbound.clone());
                }
                MasterFrame::RunShell(payload) => {
                    self.spawn_task(shell_job(payload), outbound.clone());
                }
                MasterFrame::CancelTask { task_run_id } => {
                    debug!(%task_run_id, "cancel requested by master");
                    self.executor.cancel(task_run_id).await;
                }
                MasterFrame::Shutdown => {
                    info!("shutdown requested, draining in-flight tasks");
                    if !self.executor.drain(self.config.drain_timeout()).await {
                        warn!("drain timeout elapsed with tasks still running");
                        self.executor.cancel_all().await;
                    }
                    break SessionEnd::Shutdown;
                }
                MasterFrame::UnknownAgent => {
                    // The master lost our record; reconnect re-registers.
                    info!("master no longer knows us, re-registering");
                    break SessionEnd::Disconnected;
                }
                MasterFrame::HeartbeatAck => {}
            }
        };

        session_cancel.cancel();
        heartbeat_task.abort();
        let _ = writer_task.await;
        end
    }

    /// Run one task in its own worker, forwarding the stream upward. A
    /// failed status delivery lands in the redelivery buffer instead of
    /// being dropped.
    fn spawn_task(self: &Arc<Self>, job: EvalJob, outbound: mpsc::Sender<AgentFrame>) {
        let runtime = self.clone();
        let cancel = self.kill_tasks.child_token();
        tokio::spawn(async move {
            let task_run_id = job.task_run_id;
            let mut rx = runtime.executor.execute(job, cancel).await;
            while let Some(event) = rx.recv().await {
                match event {
                    DispatchEvent::Chunk(chunk) => {
                        // Chunks are best-effort once the channel is gone.
                        let _ = outbound.send(AgentFrame::Chunk(chunk)).await;
                    }
                    DispatchEvent::Done(status) => {
                        if outbound.send(AgentFrame::Status(status.clone())).await.is_err() {
                            debug!(%task_run_id, "buffering result for redelivery");
                            runtime.buffered.lock().await.insert(task_run_id, status);
                        }
                        return;
                    }
                    DispatchEvent::Custom { .. } => {}
                }
            }
        });
    }

    async fn redeliver_buffered(&self, outbound: &mpsc::Sender<AgentFrame>) {
        let statuses: Vec<FinalStatus> = {
            let mut buffered = self.buffered.lock().await;
            buffered.drain().map(|(_, status)| status).collect()
        };
        for status in statuses {
            info!(task_run_id = %status.task_run_id, "re-delivering buffered result");
            if outbound.send(AgentFrame::Redelivered(status.clone())).await.is_err() {
                // Session already gone again; keep it for the next one.
                self.buffered.lock().await.insert(status.task_run_id, status);
            }
        }
    }

    /// Answer diagnostic probes on the agent's own listener.
    async fn serve_probes(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "diagnostic listener ready");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancel.cancelled() => return Ok(()),
            };
            let Ok((stream, _)) = accepted else { continue };
            let runtime = self.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(stream);
                if let Ok(ProbeRequest::Ping) = read_frame(&mut reader).await {
                    let reply = ProbeReply::Pong {
                        name: runtime.options.name.clone(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        running_tasks: runtime.executor.running_count().await,
                    };
                    let _ = write_frame(&mut writer, &reply).await;
                }
            });
        }
    }
}

fn task_job(payload: TaskPayload) -> EvalJob {
    let timeout = payload.timeout();
    let mut env = payload.env;
    if let Some(run_id) = payload.workflow_run_id {
        env.insert("SLOTH_WORKFLOW_RUN_ID".to_string(), run_id.to_string());
    }
    EvalJob {
        task_run_id: payload.task_run_id,
        script_source: payload.script_source,
        params: payload.params,
        env,
        timeout,
    }
}

fn shell_job(payload: ShellPayload) -> EvalJob {
    let timeout = payload.timeout();
    EvalJob {
        task_run_id: payload.task_run_id,
        script_source: payload.command,
        params: BTreeMap::new(),
        env: payload.env,
        timeout,
    }
}

fn system_info() -> BTreeMap<String, String> {
    let mut info = BTreeMap::new();
    info.insert("os".to_string(), std::env::consts::OS.to_string());
    info.insert("arch".to_string(), std::env::consts::ARCH.to_string());
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_job_injects_workflow_run_id() {
        let run_id = Uuid::new_v4();
        let payload = TaskPayload {
            task_run_id: Uuid::new_v4(),
            script_source: "echo hi".to_string(),
            params: BTreeMap::new(),
            env: BTreeMap::new(),
            timeout_ms: 1000,
            workflow_run_id: Some(run_id),
        };
        let job = task_job(payload);
        assert_eq!(job.env.get("SLOTH_WORKFLOW_RUN_ID"), Some(&run_id.to_string()));
        assert_eq!(job.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_shell_job_carries_command() {
        let payload = ShellPayload {
            task_run_id: Uuid::new_v4(),
            command: "uptime".to_string(),
            env: BTreeMap::new(),
            timeout_ms: 500,
        };
        let job = shell_job(payload);
        assert_eq!(job.script_source, "uptime");
        assert_eq!(job.timeout, Duration::from_millis(500));
    }
}
