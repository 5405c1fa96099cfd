//! # protoo
//!
//! Room server binary: one shared room behind a protoo WebSocket endpoint.

#![deny(unsafe_code)]

mod lobby;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use protoo_core::Room;
use protoo_server::telemetry;
use protoo_server::{Admission, ProtooServer, RequestInfo, ServerConfig};

/// protoo room server.
#[derive(Parser, Debug)]
#[command(name = "protoo", about = "protoo room server")]
struct Cli {
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    telemetry::init_subscriber(&config.log_level, config.log_json);

    let room = Room::new();
    let server = ProtooServer::new(config);
    let shared = room.clone();
    server.set_admission_handler(move |info: RequestInfo, admission: Admission| {
        lobby::admit(shared.clone(), info, admission)
    });

    let (addr, handle) = server.listen().await.context("Failed to start server")?;
    tracing::info!("protoo listening on ws://{addr}{}", server.config().path);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    room.close().await;
    server.stop_signal().drain(handle, None).await;
    Ok(())
}
