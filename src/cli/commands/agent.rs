//! `agent *` handlers.

use anyhow::Context;
use comfy_table::{presets::UTF8_FULL, Table};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{AgentOptions, AgentRuntime};
use crate::cli::client::MasterClient;
use crate::cli::exit;
use crate::domain::models::AgentRecord;
use crate::domain::ports::OutputKind;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::Logging;
use crate::protocol::{ClientRequest, ClientResponse};

use super::{exit_code_for, print_failure, unexpected};

#[allow(clippy::too_many_arguments)]
pub async fn handle_start(
    name: String,
    master: String,
    port: Option<u16>,
    bind_address: Option<String>,
    report_address: Option<String>,
    tags: Vec<(String, String)>,
    daemon: bool,
) -> anyhow::Result<u8> {
    if daemon {
        return super::daemonize();
    }

    let config = ConfigLoader::load().context("failed to load configuration")?;
    let _logging = Logging::init(&config.logging)?;

    let mut agent_config = config.agent.clone();
    if let Some(port) = port {
        agent_config.port = port;
    }
    if let Some(bind_address) = bind_address {
        agent_config.bind_address = bind_address;
    }

    let options = AgentOptions {
        advertise_addr: format!("{}:{}", agent_config.bind_address, agent_config.port),
        name,
        master_addr: master,
        report_address,
        tags: tags.into_iter().collect(),
    };

    let runtime = Arc::new(AgentRuntime::new(options, agent_config, config.heartbeat.clone()));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    runtime.run(shutdown).await?;
    Ok(exit::OK)
}

pub async fn handle_list(master: &str) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    match client.request(ClientRequest::ListAgents).await? {
        ClientResponse::Agents(agents) => {
            print_agent_table(&agents);
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("registry", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("registry", &other)),
    }
}

pub async fn handle_get(master: &str, name: String) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    match client.request(ClientRequest::GetAgent { name }).await? {
        ClientResponse::Agent(agent) => {
            let probe_addr = agent.probe_address().to_string();
            print_agent_table(&[agent]);
            // Diagnostic dial-back; purely informational.
            match tokio::time::timeout(std::time::Duration::from_secs(2), probe(&probe_addr)).await
            {
                Ok(Ok((name, version, running))) => {
                    println!("probe: {name} v{version}, {running} running task(s)");
                }
                _ => println!("probe: {probe_addr} not answering"),
            }
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("registry", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("registry", &other)),
    }
}

pub async fn handle_run(
    master: &str,
    name: String,
    command: String,
    timeout_secs: u64,
) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    let request = ClientRequest::AgentRun {
        name,
        command,
        timeout_ms: timeout_secs.saturating_mul(1000),
    };

    let mut response = client.request(request).await?;
    loop {
        match response {
            ClientResponse::Chunk(chunk) => {
                match chunk.kind {
                    OutputKind::Stderr => std::io::stderr().write_all(&chunk.data)?,
                    _ => std::io::stdout().write_all(&chunk.data)?,
                }
                response = client.next_response().await?;
            }
            ClientResponse::ExecDone(status) => {
                if status.success {
                    return Ok(exit::OK);
                }
                print_failure("dispatch", crate::protocol::ErrorKind::Internal, &status.exit_reason);
                return Ok(exit::FAILURE);
            }
            ClientResponse::Error { kind, message } => {
                print_failure("dispatch", kind, &message);
                return Ok(exit_code_for(kind));
            }
            other => return Ok(unexpected("dispatch", &other)),
        }
    }
}

pub async fn handle_stop(master: &str, name: String) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    match client.request(ClientRequest::StopAgent { name: name.clone() }).await? {
        ClientResponse::Ok => {
            println!("stop requested for {name}");
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("registry", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("registry", &other)),
    }
}

pub async fn handle_delete(master: &str, name: String) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    match client.request(ClientRequest::DeleteAgent { name: name.clone() }).await? {
        ClientResponse::Ok => {
            println!("deleted {name}");
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("registry", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("registry", &other)),
    }
}

async fn connect(master: &str) -> anyhow::Result<MasterClient> {
    MasterClient::connect(master)
        .await
        .with_context(|| format!("master at {master} is not reachable"))
}

fn print_agent_table(agents: &[AgentRecord]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["NAME", "ADDRESS", "STATUS", "VERSION", "TAGS", "LAST HEARTBEAT"]);
    for agent in agents {
        let tags = agent
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        table.add_row(vec![
            agent.name.clone(),
            agent.address.clone(),
            agent.status.to_string(),
            agent.version.clone(),
            tags,
            agent.last_heartbeat.to_rfc3339(),
        ]);
    }
    println!("{table}");
}

pub async fn probe(addr: &str) -> anyhow::Result<(String, String, usize)> {
    use crate::protocol::{read_frame, write_frame, ProbeReply, ProbeRequest};
    let stream = tokio::net::TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);
    write_frame(&mut writer, &ProbeRequest::Ping).await?;
    let ProbeReply::Pong { name, version, running_tasks } = read_frame(&mut reader).await?;
    Ok((name, version, running_tasks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_renders_any_record_shape() {
        let mut record = AgentRecord::new("a1", "127.0.0.1:50051");
        record.tags.insert("role".into(), "web".into());
        print_agent_table(&[record]);
    }
}
