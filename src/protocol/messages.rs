//! Control-plane message types.
//!
//! One framing, three conversations:
//! - the agent session: `Hello::Agent` then a long-lived bidi stream of
//!   `MasterFrame` / `AgentFrame`;
//! - the client session: `Hello::Client` then unary `ClientRequest` /
//!   `ClientResponse` pairs (streaming responses end with a terminator);
//! - the agent's diagnostic listener: `ProbeRequest` / `ProbeReply`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::models::{AgentRecord, Event, EventFilter, Hook, RunNotice, RunReport, WorkflowDefinition};
use crate::domain::ports::{FinalStatus, OutputChunk, ShellPayload, TaskPayload};

/// First frame on every master connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Hello {
    Agent(RegisterRequest),
    Client,
}

/// Agent registration / re-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub address: String,
    pub report_address: Option<String>,
    pub version: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub system_info: BTreeMap<String, String>,
    pub max_parallel_tasks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegisterReply {
    Accepted,
    Rejected { reason: String },
}

/// Frames the master pushes down an agent's control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterFrame {
    DispatchTask(TaskPayload),
    RunShell(ShellPayload),
    CancelTask { task_run_id: Uuid },
    Shutdown,
    HeartbeatAck,
    /// Heartbeat from a name the master no longer knows; the agent must
    /// re-register.
    UnknownAgent,
}

/// Frames an agent pushes up its control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Heartbeat {
        name: String,
        #[serde(default)]
        system_info: BTreeMap<String, String>,
    },
    Chunk(OutputChunk),
    Status(FinalStatus),
    /// A buffered result from before a channel drop, re-delivered after
    /// reconnect.
    Redelivered(FinalStatus),
    /// Custom event raised by a running script.
    Custom {
        workflow_run_id: Option<Uuid>,
        event_type: String,
        payload: serde_json::Value,
    },
}

/// Unary requests from the CLI/UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Ping,
    ListAgents,
    GetAgent { name: String },
    DeleteAgent { name: String },
    StopAgent { name: String },
    AgentRun { name: String, command: String, timeout_ms: u64 },
    RunWorkflow { definition: WorkflowDefinition },
    CancelRun { run_id: Uuid },
    ListEvents { filter: EventFilter },
    GetEvent { id: Uuid },
    RetryEvent { id: Uuid },
    ListHooks,
    RegisterHook { name: String, event_type: String, command: String },
    DeleteHook { id: Uuid },
}

/// Failure categories surfaced to clients, mapped onto CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AgentUnknown,
    AgentUnreachable,
    AgentBusy,
    NotFound,
    PolicyViolation,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientResponse {
    Pong,
    Ok,
    Error { kind: ErrorKind, message: String },
    Agents(Vec<AgentRecord>),
    Agent(AgentRecord),
    Events(Vec<Event>),
    Event(Event),
    Hooks(Vec<Hook>),
    HookRegistered { id: Uuid },
    /// Streamed while `AgentRun` output arrives; `ExecDone` terminates.
    Chunk(OutputChunk),
    ExecDone(FinalStatus),
    /// Streamed while a workflow runs; `RunReport` terminates.
    Notice(RunNotice),
    Report(RunReport),
}

/// Diagnostic probe on the agent's own listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeRequest {
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeReply {
    Pong { name: String, version: String, running_tasks: usize },
}
