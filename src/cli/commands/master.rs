//! `master start` handler.

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::sqlite::{initialize_database, PoolConfig};
use crate::cli::exit;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::Logging;
use crate::master::Master;

pub async fn handle_start(
    port: Option<u16>,
    bind_address: Option<String>,
    daemon: bool,
) -> anyhow::Result<u8> {
    if daemon {
        return super::daemonize();
    }

    let mut config = ConfigLoader::load().context("failed to load configuration")?;
    if let Some(port) = port {
        config.master.port = port;
    }
    if let Some(bind_address) = bind_address {
        config.master.bind_address = bind_address;
    }

    let _logging = Logging::init(&config.logging)?;

    let database_url = format!("sqlite:{}", config.database.path);
    let pool = initialize_database(
        &database_url,
        Some(PoolConfig {
            max_connections: config.database.max_connections,
            ..PoolConfig::default()
        }),
    )
    .await
    .context("failed to initialize database")?;

    let master = Arc::new(Master::new(config, pool));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    master.serve(shutdown).await?;
    Ok(exit::OK)
}
