//! dungeon-sync-receiver binary
//!
//! Headless receiver: joins a host, downloads the dungeon and follows its
//! regenerations. Assets are not rendered; the build step is a no-op.

use anyhow::{Context, Result};
use clap::Parser;
use dungeon_sync::net::{ReceiverClient, ReceiverClientConfig};
use dungeon_sync::receiver::NullBuilder;
use dungeon_sync::SyncConfig;
use std::path::PathBuf;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "dungeon-sync-receiver", about = "Dungeon world transfer receiver", version)]
struct Args {
    /// Optional TOML file with sync settings
    #[arg(long, env = "DUNGEON_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Host control address
    #[arg(long, env = "DUNGEON_SYNC_CONTROL_ADDR", default_value = "127.0.0.1:7400")]
    control_addr: String,

    /// Host bulk address
    #[arg(long, env = "DUNGEON_SYNC_BULK_ADDR", default_value = "127.0.0.1:7401")]
    bulk_addr: String,

    /// Unique id, stable across both channels
    #[arg(long, env = "DUNGEON_SYNC_CLIENT_ID")]
    client_id: String,

    /// Display name
    #[arg(long, env = "DUNGEON_SYNC_CLIENT_NAME", default_value = "receiver")]
    name: String,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dungeon_sync=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let sync = SyncConfig::load(args.config.as_deref()).context("Failed to load config")?;

    log::info!(
        "Starting dungeon-sync-receiver '{}' -> {}",
        args.client_id,
        args.control_addr
    );

    let config = ReceiverClientConfig {
        control_addr: args.control_addr,
        bulk_addr: args.bulk_addr,
        client_unique_id: args.client_id,
        client_name: args.name,
    };
    ReceiverClient::new(config, sync, Arc::new(NullBuilder))
        .run()
        .await
}
