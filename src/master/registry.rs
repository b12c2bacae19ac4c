//! Agent registry: in-memory map of agent records with write-through
//! persistence and a heartbeat sweeper.
//!
//! The map lives under a single `RwLock`; writes (register, heartbeat,
//! delete) are rare and short, lookups dominate.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::models::event::types as event_types;
use crate::domain::models::{AgentRecord, AgentStatus, HeartbeatConfig, SelectorExpr};
use crate::domain::ports::{AgentRepository, AgentSelector, EventStore, RegistryError};

/// What a registration did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First registration under this name.
    New,
    /// Same name, different address: the agent was redeployed.
    AddressChanged,
    /// Address unchanged but version/tags/report_address differ.
    MetadataChanged,
    /// Nothing observable changed.
    Refreshed,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    /// Names already reported disconnected; cleared on heartbeat.
    disconnect_reported: RwLock<HashSet<String>>,
    repository: Arc<dyn AgentRepository>,
    events: Arc<dyn EventStore>,
    heartbeat: HeartbeatConfig,
}

impl AgentRegistry {
    pub fn new(
        repository: Arc<dyn AgentRepository>,
        events: Arc<dyn EventStore>,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            disconnect_reported: RwLock::new(HashSet::new()),
            repository,
            events,
            heartbeat,
        }
    }

    /// Load persisted records. Everything comes back Unreachable until the
    /// next heartbeat proves otherwise.
    pub async fn load_persisted(&self) -> Result<usize, RegistryError> {
        let mut records = self.repository.load_all().await?;
        let mut agents = self.agents.write().await;
        for record in &mut records {
            record.status = AgentStatus::Unreachable;
            agents.insert(record.name.clone(), record.clone());
        }
        Ok(agents.len())
    }

    /// Create or refresh a record. Address changes overwrite (agents may be
    /// redeployed). Emits `agent.registered` for new/moved agents and
    /// `agent.updated` for metadata changes; system_info-only changes stay
    /// silent.
    pub async fn register(&self, mut record: AgentRecord) -> Result<RegisterOutcome, RegistryError> {
        record.status = AgentStatus::Active;
        record.last_heartbeat = Utc::now();

        let outcome = {
            let mut agents = self.agents.write().await;
            let outcome = match agents.get(&record.name) {
                None => RegisterOutcome::New,
                Some(existing) => {
                    record.registered_at = existing.registered_at;
                    if existing.address != record.address {
                        RegisterOutcome::AddressChanged
                    } else if existing.version != record.version
                        || existing.tags != record.tags
                        || existing.report_address != record.report_address
                    {
                        RegisterOutcome::MetadataChanged
                    } else {
                        RegisterOutcome::Refreshed
                    }
                }
            };
            agents.insert(record.name.clone(), record.clone());
            outcome
        };
        self.disconnect_reported.write().await.remove(&record.name);

        self.repository.upsert(&record).await?;

        match outcome {
            RegisterOutcome::New | RegisterOutcome::AddressChanged => {
                info!(agent = %record.name, address = %record.address, "agent registered");
                self.emit(
                    event_types::AGENT_REGISTERED,
                    serde_json::json!({
                        "name": record.name,
                        "address": record.address,
                        "version": record.version,
                        "tags": record.tags,
                    }),
                )
                .await;
            }
            RegisterOutcome::MetadataChanged => {
                debug!(agent = %record.name, "agent metadata updated");
                self.emit(
                    event_types::AGENT_UPDATED,
                    serde_json::json!({
                        "name": record.name,
                        "version": record.version,
                        "tags": record.tags,
                    }),
                )
                .await;
            }
            RegisterOutcome::Refreshed => {}
        }

        Ok(outcome)
    }

    /// Record a heartbeat. `Unknown` tells the agent to re-register.
    pub async fn heartbeat(
        &self,
        name: &str,
        system_info: BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        let record = {
            let mut agents = self.agents.write().await;
            let Some(record) = agents.get_mut(name) else {
                return Err(RegistryError::Unknown(name.to_string()));
            };
            record.last_heartbeat = Utc::now();
            record.status = AgentStatus::Active;
            if !system_info.is_empty() {
                record.system_info = system_info;
            }
            record.clone()
        };
        self.disconnect_reported.write().await.remove(name);

        if let Err(e) = self.repository.upsert(&record).await {
            warn!(agent = name, error = %e, "failed to persist heartbeat");
        }
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<AgentRecord> {
        let mut all: Vec<_> = self.agents.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Hard delete.
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let removed = self.agents.write().await.remove(name);
        if removed.is_none() {
            return Err(RegistryError::Unknown(name.to_string()));
        }
        self.repository.delete(name).await
    }

    pub async fn set_status(&self, name: &str, status: AgentStatus) {
        let record = {
            let mut agents = self.agents.write().await;
            let Some(record) = agents.get_mut(name) else { return };
            record.status = status;
            record.clone()
        };
        if let Err(e) = self.repository.upsert(&record).await {
            warn!(agent = name, error = %e, "failed to persist status change");
        }
    }

    /// One sweep over all records; called every half heartbeat interval.
    pub async fn sweep_once(&self) {
        let now = Utc::now();
        let unreachable_after = self.heartbeat.unreachable_after();
        let disconnected_after = self.heartbeat.disconnected_after();

        let mut went_unreachable = Vec::new();
        let mut went_disconnected = Vec::new();
        {
            let mut agents = self.agents.write().await;
            let mut reported = self.disconnect_reported.write().await;
            for record in agents.values_mut() {
                let stale = now - record.last_heartbeat;
                if record.status == AgentStatus::Active && stale > unreachable_after {
                    record.status = AgentStatus::Unreachable;
                    went_unreachable.push(record.clone());
                }
                if stale > disconnected_after
                    && record.status == AgentStatus::Unreachable
                    && reported.insert(record.name.clone())
                {
                    went_disconnected.push(record.name.clone());
                }
            }
        }

        for record in went_unreachable {
            warn!(agent = %record.name, "heartbeat overdue, marking unreachable");
            if let Err(e) = self.repository.upsert(&record).await {
                warn!(agent = %record.name, error = %e, "failed to persist unreachable status");
            }
            self.emit(
                event_types::AGENT_HEARTBEAT_FAILED,
                serde_json::json!({ "name": record.name, "last_heartbeat": record.last_heartbeat }),
            )
            .await;
        }
        for name in went_disconnected {
            warn!(agent = %name, "agent considered disconnected");
            self.emit(event_types::AGENT_DISCONNECTED, serde_json::json!({ "name": name }))
                .await;
        }
    }

    /// Run the sweeper until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat.sweep_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once().await,
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(e) = self.events.append(event_type, payload).await {
            warn!(event_type, error = %e, "failed to append registry event");
        }
    }
}

#[async_trait::async_trait]
impl AgentSelector for AgentRegistry {
    async fn select(&self, expr: &SelectorExpr) -> Result<Vec<AgentRecord>, RegistryError> {
        let agents = self.agents.read().await;
        let mut matched: Vec<AgentRecord> = agents
            .values()
            .filter(|r| expr.matches(&r.name, &r.tags))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matched)
    }
}
