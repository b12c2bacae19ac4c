//! Task execution on the worker host.
//!
//! Each task runs in a dedicated worker owning a cancellation token; a
//! bounded semaphore caps concurrency at the advertised
//! `max_parallel_tasks`. Subprocess stdout/stderr are line-framed and
//! forwarded as chunks as soon as they are produced.

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ports::{
    DispatchEvent, EvalJob, EvalOutcome, EvalOutput, Evaluator, FinalStatus, OutputChunk,
    OutputKind,
};

const EVAL_OUTPUT_DEPTH: usize = 64;
const STREAM_DEPTH: usize = 256;

/// Runs scripts through an external interpreter subprocess.
///
/// The real DSL evaluator (with the module catalog sandbox) plugs in
/// behind the same `Evaluator` port; this implementation covers shell
/// execution and keeps the streaming/kill semantics in one place.
pub struct ProcessEvaluator {
    interpreter: String,
}

impl ProcessEvaluator {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self { interpreter: interpreter.into() }
    }
}

#[async_trait]
impl Evaluator for ProcessEvaluator {
    async fn run(
        &self,
        job: EvalJob,
        output: mpsc::Sender<EvalOutput>,
        cancel: CancellationToken,
    ) -> EvalOutcome {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-c")
            .arg(&job.script_source)
            .envs(&job.env)
            .env("SLOTH_TASK_RUN_ID", job.task_run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if !job.params.is_empty() {
            cmd.env(
                "SLOTH_PARAMS",
                serde_json::to_string(&job.params).unwrap_or_default(),
            );
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return EvalOutcome::failed(format!("spawn failed: {e}")),
        };
        let pgid = child.id();

        let stdout_task = child.stdout.take().map(|pipe| {
            tokio::spawn(forward_lines(pipe, OutputKind::Stdout, output.clone()))
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(forward_lines(pipe, OutputKind::Stderr, output.clone()))
        });
        drop(output);

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => EvalOutcome::ok(None),
                Ok(status) => EvalOutcome::failed(format!("exit status {}", status.code().unwrap_or(-1))),
                Err(e) => EvalOutcome::failed(format!("wait failed: {e}")),
            },
            _ = tokio::time::sleep(job.timeout) => {
                kill_process_group(pgid);
                let _ = child.wait().await;
                EvalOutcome::timeout()
            }
            _ = cancel.cancelled() => {
                kill_process_group(pgid);
                let _ = child.wait().await;
                EvalOutcome::cancelled()
            }
        };

        // Drain the readers so every produced line precedes the status.
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        outcome
    }
}

async fn forward_lines<R>(pipe: R, kind: OutputKind, output: mpsc::Sender<EvalOutput>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut data = line.into_bytes();
        data.push(b'\n');
        if output.send(EvalOutput { kind, data }).await.is_err() {
            return;
        }
    }
}

/// Kill the subprocess and all of its descendants.
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(pid, error = %e, "failed to kill process group");
        }
    }
}

/// Bounded task runner shared by the agent runtime and the master's local
/// dispatch path.
pub struct TaskExecutor {
    evaluator: Arc<dyn Evaluator>,
    semaphore: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl TaskExecutor {
    pub fn new(evaluator: Arc<dyn Evaluator>, max_parallel_tasks: u32) -> Self {
        Self {
            evaluator,
            semaphore: Arc::new(Semaphore::new(max_parallel_tasks.max(1) as usize)),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Cancel one running task; a no-op for unknown ids.
    pub async fn cancel(&self, task_run_id: Uuid) {
        if let Some(token) = self.running.lock().await.get(&task_run_id) {
            token.cancel();
        }
    }

    pub async fn cancel_all(&self) {
        for token in self.running.lock().await.values() {
            token.cancel();
        }
    }

    /// Execute a job, streaming chunks and exactly one terminal status.
    ///
    /// Chunk sequence numbers are contiguous from 0 per task run,
    /// regardless of which pipe produced them.
    pub async fn execute(
        &self,
        job: EvalJob,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<DispatchEvent> {
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let evaluator = self.evaluator.clone();
        let semaphore = self.semaphore.clone();
        let running = self.running.clone();
        let task_run_id = job.task_run_id;

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            running.lock().await.insert(task_run_id, cancel.clone());
            let started = Instant::now();

            let (eval_tx, mut eval_rx) = mpsc::channel::<EvalOutput>(EVAL_OUTPUT_DEPTH);
            let chunk_tx = tx.clone();
            let forwarder = tokio::spawn(async move {
                let mut seq = 0u64;
                while let Some(out) = eval_rx.recv().await {
                    let chunk = OutputChunk { task_run_id, kind: out.kind, data: out.data, seq };
                    seq += 1;
                    if chunk_tx.send(DispatchEvent::Chunk(chunk)).await.is_err() {
                        break;
                    }
                }
            });

            let outcome = evaluator.run(job, eval_tx, cancel.clone()).await;
            let _ = forwarder.await;
            running.lock().await.remove(&task_run_id);

            debug!(%task_run_id, success = outcome.success, reason = %outcome.exit_reason, "task finished");
            let _ = tx
                .send(DispatchEvent::Done(FinalStatus {
                    task_run_id,
                    success: outcome.success,
                    exit_reason: outcome.exit_reason,
                    output_blob: outcome.output,
                    duration_ms: started.elapsed().as_millis() as u64,
                }))
                .await;
        });

        rx
    }

    /// Wait for in-flight tasks to finish, up to the drain timeout.
    /// Returns true when everything drained.
    pub async fn drain(&self, timeout: std::time::Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.running.lock().await.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn shell_job(script: &str, timeout: Duration) -> EvalJob {
        EvalJob {
            task_run_id: Uuid::new_v4(),
            script_source: script.to_string(),
            params: BTreeMap::new(),
            env: BTreeMap::new(),
            timeout,
        }
    }

    fn executor() -> TaskExecutor {
        TaskExecutor::new(Arc::new(ProcessEvaluator::new("sh")), 4)
    }

    async fn collect(mut rx: mpsc::Receiver<DispatchEvent>) -> (Vec<OutputChunk>, FinalStatus) {
        let mut chunks = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                DispatchEvent::Chunk(chunk) => chunks.push(chunk),
                DispatchEvent::Done(status) => return (chunks, status),
                DispatchEvent::Custom { .. } => {}
            }
        }
        panic!("stream ended without a terminal status");
    }

    #[tokio::test]
    async fn test_successful_command_streams_stdout() {
        let executor = executor();
        let rx = executor
            .execute(shell_job("echo hi", Duration::from_secs(10)), CancellationToken::new())
            .await;
        let (chunks, status) = collect(rx).await;

        assert!(status.success);
        assert_eq!(status.exit_reason, "ok");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, b"hi\n");
        assert_eq!(chunks[0].kind, OutputKind::Stdout);
    }

    #[tokio::test]
    async fn test_chunk_sequences_are_contiguous_from_zero() {
        let executor = executor();
        let rx = executor
            .execute(
                shell_job("echo a; echo oops >&2; echo b", Duration::from_secs(10)),
                CancellationToken::new(),
            )
            .await;
        let (chunks, status) = collect(rx).await;

        assert!(status.success);
        assert_eq!(chunks.len(), 3);
        let seqs: Vec<u64> = chunks.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(chunks.iter().any(|c| c.kind == OutputKind::Stderr));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let executor = executor();
        let rx = executor
            .execute(shell_job("exit 3", Duration::from_secs(10)), CancellationToken::new())
            .await;
        let (_, status) = collect(rx).await;

        assert!(!status.success);
        assert_eq!(status.exit_reason, "exit status 3");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let executor = executor();
        let rx = executor
            .execute(shell_job("sleep 30", Duration::from_millis(200)), CancellationToken::new())
            .await;
        let (_, status) = collect(rx).await;

        assert!(!status.success);
        assert_eq!(status.exit_reason, "timeout");
    }

    #[tokio::test]
    async fn test_cancellation_kills_and_reports() {
        let executor = executor();
        let cancel = CancellationToken::new();
        let rx = executor
            .execute(shell_job("sleep 30", Duration::from_secs(60)), cancel.clone())
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let (_, status) = collect(rx).await;
        assert!(!status.success);
        assert_eq!(status.exit_reason, "cancelled");
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() {
        let executor = TaskExecutor::new(Arc::new(ProcessEvaluator::new("sh")), 1);
        let cancel = CancellationToken::new();

        let first = executor
            .execute(shell_job("sleep 0.3", Duration::from_secs(10)), cancel.clone())
            .await;
        let second = executor
            .execute(shell_job("echo fast", Duration::from_secs(10)), cancel.clone())
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Only one slot: the second task is still queued behind the permit.
        assert_eq!(executor.running_count().await, 1);

        let (_, s1) = collect(first).await;
        let (_, s2) = collect(second).await;
        assert!(s1.success && s2.success);
    }

    #[tokio::test]
    async fn test_drain_waits_for_running_tasks() {
        let executor = executor();
        let rx = executor
            .execute(shell_job("sleep 0.2", Duration::from_secs(10)), CancellationToken::new())
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executor.drain(Duration::from_secs(5)).await);
        let (_, status) = collect(rx).await;
        assert!(status.success);
    }
}
