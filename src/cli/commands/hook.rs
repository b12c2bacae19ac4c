//! `hook *` handlers.

use anyhow::Context;
use comfy_table::{presets::UTF8_FULL, Table};
use uuid::Uuid;

use crate::cli::client::MasterClient;
use crate::cli::exit;
use crate::protocol::{ClientRequest, ClientResponse};

use super::{exit_code_for, print_failure, unexpected};

pub async fn handle_add(
    master: &str,
    name: String,
    event: String,
    command: String,
) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    let request = ClientRequest::RegisterHook { name, event_type: event, command };
    match client.request(request).await? {
        ClientResponse::HookRegistered { id } => {
            println!("hook registered: {id}");
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("hooks", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("hooks", &other)),
    }
}

pub async fn handle_list(master: &str) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    match client.request(ClientRequest::ListHooks).await? {
        ClientResponse::Hooks(hooks) => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["ID", "NAME", "EVENT", "COMMAND", "ENABLED"]);
            for hook in hooks {
                table.add_row(vec![
                    hook.id.to_string(),
                    hook.name,
                    hook.event_type,
                    hook.action,
                    hook.enabled.to_string(),
                ]);
            }
            println!("{table}");
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("hooks", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("hooks", &other)),
    }
}

pub async fn handle_delete(master: &str, id: Uuid) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    match client.request(ClientRequest::DeleteHook { id }).await? {
        ClientResponse::Ok => {
            println!("hook {id} deleted");
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("hooks", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("hooks", &other)),
    }
}

async fn connect(master: &str) -> anyhow::Result<MasterClient> {
    MasterClient::connect(master)
        .await
        .with_context(|| format!("master at {master} is not reachable"))
}
