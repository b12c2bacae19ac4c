//! Domain models shared across master, agent and engine.

pub mod agent;
pub mod config;
pub mod dag;
pub mod event;
pub mod hook;
pub mod selector;
pub mod task;
pub mod value;
pub mod workflow;

pub use agent::{AgentRecord, AgentStatus};
pub use config::{
    AgentConfig, Config, DatabaseConfig, HeartbeatConfig, HookDispatcherConfig, LoggingConfig,
    MasterConfig,
};
pub use dag::{DagError, WorkflowDag};
pub use event::{Event, EventFilter, EventStatus};
pub use hook::Hook;
pub use selector::{SelectorError, SelectorExpr, TagTerm};
pub use task::{BackoffKind, RetryPolicy, TaskDescriptor, TaskState, DEFAULT_TASK_TIMEOUT};
pub use value::Value;
pub use workflow::{RunNotice, RunReport, RunStatus, TaskReport, WorkflowDefinition};
