//! Event store port.
//!
//! A durable queue of typed events with per-record delivery state. Append
//! commits synchronously before the caller is acknowledged; claims move
//! records to Processing atomically; a recovery pass at startup returns
//! orphaned Processing records to Pending so nothing is stuck forever.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::{Event, EventFilter};

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event {0} not found")]
    NotFound(Uuid),
    #[error("event {id} is already terminal ({status})")]
    Terminal { id: Uuid, status: String },
    #[error("failed to append event: {0}")]
    Append(String),
    #[error("failed to query events: {0}")]
    Query(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("database error: {0}")]
    Database(String),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably insert a Pending event; returns its id.
    async fn append(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, EventStoreError>;

    /// Atomically move up to `n` claimable Pending events to Processing
    /// and return them, oldest sequence first. Each claim counts as a
    /// delivery attempt. Events with a future `not_before` are skipped.
    async fn claim(&self, n: u32) -> Result<Vec<Event>, EventStoreError>;

    /// Processing → Completed. Terminal states are absorbing.
    async fn complete(&self, id: Uuid) -> Result<(), EventStoreError>;

    /// Processing → Failed with the final error.
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), EventStoreError>;

    /// Processing → Pending with a `not_before` delay for the next claim.
    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), EventStoreError>;

    /// Pending or Processing → Cancelled.
    async fn cancel(&self, id: Uuid) -> Result<(), EventStoreError>;

    /// Re-queue a terminal event for another delivery round (operator
    /// `events retry`).
    async fn requeue(&self, id: Uuid) -> Result<(), EventStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Event>, EventStoreError>;

    async fn list(&self, filter: EventFilter) -> Result<Vec<Event>, EventStoreError>;

    /// Reset orphaned Processing events (e.g. after a crash) back to
    /// Pending. Returns how many were recovered.
    async fn recover_orphans(&self) -> Result<u64, EventStoreError>;
}
