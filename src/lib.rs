//! Sloth Runner: distributed task orchestration.
//!
//! A master node hosts the agent registry, durable event queue, hook
//! dispatcher and workflow engine; agent nodes hold agent-initiated
//! control channels to the master and execute dispatched tasks.

pub mod adapters;
pub mod agent;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod master;
pub mod protocol;
pub mod services;
