//! `run` handler: submit a workflow and stream its progress.

use anyhow::Context;
use std::path::Path;

use crate::cli::client::MasterClient;
use crate::cli::exit;
use crate::domain::models::{RunNotice, RunStatus, WorkflowDefinition};
use crate::protocol::{ClientRequest, ClientResponse};

use super::{exit_code_for, print_failure, unexpected};

pub async fn handle_run(master: &str, workflow: String, file: &Path) -> anyhow::Result<u8> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut definition: WorkflowDefinition = serde_yaml::from_str(&source)
        .with_context(|| format!("failed to parse workflow definition {}", file.display()))?;
    definition.name = workflow;

    let mut client = MasterClient::connect(master)
        .await
        .with_context(|| format!("master at {master} is not reachable"))?;

    let mut response = client.request(ClientRequest::RunWorkflow { definition }).await?;
    loop {
        match response {
            ClientResponse::Notice(notice) => {
                print_notice(&notice);
                response = client.next_response().await?;
            }
            ClientResponse::Report(report) => {
                let failed: Vec<_> = report
                    .tasks
                    .iter()
                    .filter(|t| t.state != crate::domain::models::TaskState::Succeeded)
                    .collect();
                println!(
                    "workflow {} {} ({} tasks, {} not succeeded)",
                    report.workflow_name,
                    report.status,
                    report.tasks.len(),
                    failed.len(),
                );
                return Ok(match report.status {
                    RunStatus::Completed => exit::OK,
                    _ => exit::PARTIAL_FAILURE,
                });
            }
            ClientResponse::Error { kind, message } => {
                print_failure("workflow", kind, &message);
                return Ok(exit_code_for(kind));
            }
            other => return Ok(unexpected("workflow", &other)),
        }
    }
}

fn print_notice(notice: &RunNotice) {
    match notice {
        RunNotice::RunStarted { run_id, workflow_name } => {
            println!("run {run_id} started ({workflow_name})");
        }
        RunNotice::TaskStateChanged { task_id, state, agent } => match agent {
            Some(agent) => println!("task {task_id}: {state} on {agent}"),
            None => println!("task {task_id}: {state}"),
        },
        RunNotice::TaskOutput { task_id, kind, line } => {
            println!("[{task_id}/{kind}] {line}");
        }
        RunNotice::RunFinished { status } => {
            println!("run finished: {status}");
        }
    }
}
