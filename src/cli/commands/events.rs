//! `events *` handlers.

use anyhow::Context;
use comfy_table::{presets::UTF8_FULL, Table};
use uuid::Uuid;

use crate::cli::client::MasterClient;
use crate::cli::exit;
use crate::domain::models::EventFilter;
use crate::protocol::{ClientRequest, ClientResponse};

use super::{exit_code_for, print_failure, unexpected};

pub async fn handle_list(
    master: &str,
    event_type: Option<String>,
    limit: u32,
) -> anyhow::Result<u8> {
    let mut filter = EventFilter::new().limit(limit);
    if let Some(t) = event_type {
        filter = filter.event_type(t);
    }

    let mut client = connect(master).await?;
    match client.request(ClientRequest::ListEvents { filter }).await? {
        ClientResponse::Events(events) => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["ID", "SEQ", "TYPE", "STATUS", "ATTEMPTS", "CREATED"]);
            for event in events {
                table.add_row(vec![
                    event.id.to_string(),
                    event.sequence.to_string(),
                    event.event_type,
                    event.status.to_string(),
                    event.attempts.to_string(),
                    event.created_at.to_rfc3339(),
                ]);
            }
            println!("{table}");
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("events", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("events", &other)),
    }
}

pub async fn handle_retry(master: &str, id: Uuid) -> anyhow::Result<u8> {
    let mut client = connect(master).await?;
    match client.request(ClientRequest::RetryEvent { id }).await? {
        ClientResponse::Ok => {
            println!("event {id} re-queued");
            Ok(exit::OK)
        }
        ClientResponse::Error { kind, message } => {
            print_failure("events", kind, &message);
            Ok(exit_code_for(kind))
        }
        other => Ok(unexpected("events", &other)),
    }
}

async fn connect(master: &str) -> anyhow::Result<MasterClient> {
    MasterClient::connect(master)
        .await
        .with_context(|| format!("master at {master} is not reachable"))
}
