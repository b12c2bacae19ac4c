//! Core services: the workflow engine and the hook dispatcher.

pub mod hook_dispatcher;
pub mod workflow_engine;

pub use hook_dispatcher::HookDispatcher;
pub use workflow_engine::{EngineError, WorkflowEngine};
