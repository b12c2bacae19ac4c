//! Per-agent control channels and dispatch stream routing.
//!
//! Each agent keeps one long-lived, agent-initiated connection; the master
//! multiplexes concurrent dispatches over it as independent streams keyed
//! by `task_run_id`. The map is RW-locked; lookups are the hot path.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ports::{DispatchEvent, FinalStatus, OutputChunk};
use crate::protocol::MasterFrame;

/// Outbound frame buffer per agent session.
const OUTBOUND_DEPTH: usize = 64;
/// Per-dispatch stream buffer.
const STREAM_DEPTH: usize = 256;

struct AgentChannel {
    session_id: Uuid,
    outbound: mpsc::Sender<MasterFrame>,
    cancel: CancellationToken,
}

struct PendingStream {
    agent: String,
    tx: mpsc::Sender<DispatchEvent>,
}

/// Registry of live agent sessions and in-flight dispatch streams.
#[derive(Default)]
pub struct ChannelMap {
    channels: RwLock<HashMap<String, AgentChannel>>,
    pending: Mutex<HashMap<Uuid, PendingStream>>,
    /// Buffered final statuses that arrived with no live waiter.
    late_results: Mutex<HashMap<Uuid, FinalStatus>>,
    in_flight: StdMutex<HashMap<String, usize>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh session for an agent, closing any previous one.
    /// Returns the outbound receiver for the session writer plus its ids.
    pub async fn attach(
        &self,
        agent: &str,
    ) -> (Uuid, mpsc::Receiver<MasterFrame>, CancellationToken) {
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        let session_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let old = {
            let mut channels = self.channels.write().await;
            channels.insert(
                agent.to_string(),
                AgentChannel { session_id, outbound: tx, cancel: cancel.clone() },
            )
        };
        if let Some(old) = old {
            debug!(agent, "replacing existing control channel");
            old.cancel.cancel();
        }

        (session_id, rx, cancel)
    }

    /// Tear down a session if it is still the current one, dropping every
    /// dispatch stream that was multiplexed over it.
    pub async fn detach(&self, agent: &str, session_id: Uuid) {
        {
            let mut channels = self.channels.write().await;
            match channels.get(agent) {
                Some(current) if current.session_id == session_id => {
                    if let Some(channel) = channels.remove(agent) {
                        channel.cancel.cancel();
                    }
                }
                _ => return,
            }
        }

        let dropped: Vec<Uuid> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, p)| p.agent == agent)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                pending.remove(id);
            }
            ids
        };
        if !dropped.is_empty() {
            warn!(agent, count = dropped.len(), "channel dropped with dispatches in flight");
            self.clear_in_flight(agent, dropped.len());
        }
    }

    pub async fn is_attached(&self, agent: &str) -> bool {
        self.channels.read().await.contains_key(agent)
    }

    /// Send a frame down an agent's channel.
    pub async fn send(&self, agent: &str, frame: MasterFrame) -> bool {
        let outbound = {
            let channels = self.channels.read().await;
            channels.get(agent).map(|c| c.outbound.clone())
        };
        match outbound {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Open a dispatch stream for a task on an agent.
    pub async fn open_stream(
        &self,
        agent: &str,
        task_run_id: Uuid,
    ) -> mpsc::Receiver<DispatchEvent> {
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        self.pending
            .lock()
            .await
            .insert(task_run_id, PendingStream { agent: agent.to_string(), tx });
        self.bump_in_flight(agent, 1);
        rx
    }

    /// Drop a stream that never produced a terminal status (send failure).
    pub async fn abort_stream(&self, task_run_id: Uuid) {
        if let Some(stream) = self.pending.lock().await.remove(&task_run_id) {
            self.clear_in_flight(&stream.agent, 1);
        }
    }

    pub async fn route_chunk(&self, chunk: OutputChunk) {
        let tx = {
            let pending = self.pending.lock().await;
            pending.get(&chunk.task_run_id).map(|p| p.tx.clone())
        };
        if let Some(tx) = tx {
            // A slow consumer drops chunks rather than stalling the
            // channel reader for every other stream.
            if tx.try_send(DispatchEvent::Chunk(chunk)).is_err() {
                debug!("dispatch stream full, dropping chunk");
            }
        }
    }

    /// Route a terminal status to its waiter, or buffer it as a late
    /// result when the waiter is gone.
    pub async fn route_status(&self, status: FinalStatus) {
        let stream = self.pending.lock().await.remove(&status.task_run_id);
        match stream {
            Some(stream) => {
                self.clear_in_flight(&stream.agent, 1);
                let _ = stream.tx.send(DispatchEvent::Done(status)).await;
            }
            None => {
                debug!(task_run_id = %status.task_run_id, "buffering late final status");
                self.late_results.lock().await.insert(status.task_run_id, status);
            }
        }
    }

    pub async fn take_late_result(&self, task_run_id: Uuid) -> Option<FinalStatus> {
        self.late_results.lock().await.remove(&task_run_id)
    }

    pub fn in_flight(&self, agent: &str) -> usize {
        self.in_flight
            .lock()
            .map(|m| m.get(agent).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn bump_in_flight(&self, agent: &str, by: usize) {
        if let Ok(mut m) = self.in_flight.lock() {
            *m.entry(agent.to_string()).or_insert(0) += by;
        }
    }

    fn clear_in_flight(&self, agent: &str, by: usize) {
        if let Ok(mut m) = self.in_flight.lock() {
            if let Some(count) = m.get_mut(agent) {
                *count = count.saturating_sub(by);
            }
        }
    }
}
