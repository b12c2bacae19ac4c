//! Command-line interface.

pub mod client;
pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Process exit codes.
pub mod exit {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
    #[allow(dead_code)]
    pub const USAGE: u8 = 2; // produced by clap itself
    pub const AGENT_UNREACHABLE: u8 = 3;
    pub const PARTIAL_FAILURE: u8 = 4;
}

#[derive(Parser)]
#[command(name = "sloth-runner")]
#[command(about = "Sloth Runner - distributed task orchestration", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Master address for client commands
    #[arg(long, global = true, default_value = "127.0.0.1:50053", env = "SLOTH_MASTER")]
    pub master: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Master node commands
    #[command(subcommand)]
    Master(MasterCommands),

    /// Agent node commands
    #[command(subcommand)]
    Agent(AgentCommands),

    /// Execute a workflow; exit 0 iff every task succeeded
    Run {
        /// Workflow name
        workflow: String,

        /// Workflow definition file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Event queue commands
    #[command(subcommand)]
    Events(EventsCommands),

    /// Hook management commands
    #[command(subcommand)]
    Hook(HookCommands),
}

#[derive(Subcommand)]
pub enum MasterCommands {
    /// Start the master node
    Start {
        /// Listen port
        #[arg(long)]
        port: Option<u16>,

        /// Bind address
        #[arg(long)]
        bind_address: Option<String>,

        /// Detach and run in the background
        #[arg(long)]
        daemon: bool,
    },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Start an agent node, registering with `--master`
    Start {
        /// Unique agent name
        #[arg(long)]
        name: String,

        /// Diagnostic probe port
        #[arg(long)]
        port: Option<u16>,

        /// Bind address for the diagnostic listener
        #[arg(long)]
        bind_address: Option<String>,

        /// Address the master should report/probe (NAT traversal)
        #[arg(long)]
        report_address: Option<String>,

        /// Selection tags, key=value (repeatable)
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,

        /// Detach and run in the background
        #[arg(long)]
        daemon: bool,
    },

    /// List registered agents
    List,

    /// Show one agent
    Get { name: String },

    /// Run an ad-hoc shell command on an agent
    Run {
        name: String,
        command: String,

        /// Command timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
    },

    /// Ask an agent to shut down gracefully
    Stop { name: String },

    /// Delete an agent record
    Delete { name: String },
}

#[derive(Subcommand)]
pub enum EventsCommands {
    /// List queued and settled events
    List {
        /// Filter by event type
        #[arg(long = "type")]
        event_type: Option<String>,

        /// Maximum number of events
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Re-queue a terminal event for delivery
    Retry { id: Uuid },
}

#[derive(Subcommand)]
pub enum HookCommands {
    /// Register a hook
    Add {
        #[arg(long)]
        name: String,

        /// Event type or glob, e.g. task.failed or task.*
        #[arg(long)]
        event: String,

        /// Command line to run on matching events
        #[arg(long)]
        command: String,
    },

    /// List registered hooks
    List,

    /// Delete a hook
    Delete { id: Uuid },
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_master_start() {
        let cli = Cli::try_parse_from(["sloth-runner", "master", "start", "--port", "6000"]).unwrap();
        match cli.command {
            Commands::Master(MasterCommands::Start { port, daemon, .. }) => {
                assert_eq!(port, Some(6000));
                assert!(!daemon);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_parse_agent_start_with_tags() {
        let cli = Cli::try_parse_from([
            "sloth-runner", "agent", "start", "--name", "a1", "--master", "10.0.0.1:50053",
            "--tag", "role=web", "--tag", "zone=eu",
        ])
        .unwrap();
        assert_eq!(cli.master, "10.0.0.1:50053", "global flag reaches subcommands");
        match cli.command {
            Commands::Agent(AgentCommands::Start { name, tags, .. }) => {
                assert_eq!(name, "a1");
                assert_eq!(tags.len(), 2);
                assert_eq!(tags[0], ("role".to_string(), "web".to_string()));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_parse_run() {
        let cli =
            Cli::try_parse_from(["sloth-runner", "run", "deploy", "--file", "deploy.sloth"]).unwrap();
        match cli.command {
            Commands::Run { workflow, file } => {
                assert_eq!(workflow, "deploy");
                assert_eq!(file, PathBuf::from("deploy.sloth"));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_parse_events_list_with_type() {
        let cli = Cli::try_parse_from([
            "sloth-runner", "events", "list", "--type", "task.failed", "--limit", "10",
        ])
        .unwrap();
        match cli.command {
            Commands::Events(EventsCommands::List { event_type, limit }) => {
                assert_eq!(event_type.as_deref(), Some("task.failed"));
                assert_eq!(limit, 10);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_missing_required_flag_is_usage_error() {
        assert!(Cli::try_parse_from(["sloth-runner", "agent", "start"]).is_err());
    }
}
