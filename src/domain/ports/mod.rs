//! Port traits: the seams between the engine, registry, control plane,
//! persistence and the external evaluator.

pub mod agent_repository;
pub mod dispatcher;
pub mod evaluator;
pub mod event_store;
pub mod hook_repository;
pub mod run_repository;
pub mod selector;

pub use agent_repository::{AgentRepository, RegistryError};
pub use dispatcher::{
    DispatchError, DispatchEvent, Dispatcher, FinalStatus, OutputChunk, OutputKind, ShellPayload,
    TaskPayload,
};
pub use evaluator::{EvalJob, EvalOutcome, EvalOutput, Evaluator};
pub use event_store::{EventStore, EventStoreError};
pub use hook_repository::HookRepository;
pub use run_repository::{RunRepository, TaskRunRecord};
pub use selector::AgentSelector;
