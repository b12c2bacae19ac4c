//! Sloth Runner CLI entry point.

use clap::Parser;
use std::process::ExitCode;

use sloth_runner::cli::commands::{agent, events, hook, master, run};
use sloth_runner::cli::{exit, AgentCommands, Cli, Commands, EventsCommands, HookCommands, MasterCommands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Master(MasterCommands::Start { port, bind_address, daemon }) => {
            master::handle_start(port, bind_address, daemon).await
        }

        Commands::Agent(agent_cmd) => match agent_cmd {
            AgentCommands::Start { name, port, bind_address, report_address, tags, daemon } => {
                agent::handle_start(
                    name,
                    cli.master.clone(),
                    port,
                    bind_address,
                    report_address,
                    tags,
                    daemon,
                )
                .await
            }
            AgentCommands::List => agent::handle_list(&cli.master).await,
            AgentCommands::Get { name } => agent::handle_get(&cli.master, name).await,
            AgentCommands::Run { name, command, timeout } => {
                agent::handle_run(&cli.master, name, command, timeout).await
            }
            AgentCommands::Stop { name } => agent::handle_stop(&cli.master, name).await,
            AgentCommands::Delete { name } => agent::handle_delete(&cli.master, name).await,
        },

        Commands::Run { workflow, file } => run::handle_run(&cli.master, workflow, &file).await,

        Commands::Events(events_cmd) => match events_cmd {
            EventsCommands::List { event_type, limit } => {
                events::handle_list(&cli.master, event_type, limit).await
            }
            EventsCommands::Retry { id } => events::handle_retry(&cli.master, id).await,
        },

        Commands::Hook(hook_cmd) => match hook_cmd {
            HookCommands::Add { name, event, command } => {
                hook::handle_add(&cli.master, name, event, command).await
            }
            HookCommands::List => hook::handle_list(&cli.master).await,
            HookCommands::Delete { id } => hook::handle_delete(&cli.master, id).await,
        },
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: internal (cli): {e:#}");
            ExitCode::from(exit::FAILURE)
        }
    }
}
