//! dungeon-sync-host binary
//!
//! Generates a dungeon, listens for receivers and streams the world to
//! each of them before releasing gameplay.
//!
//! ## Configuration (env / TOML via `config` crate)
//!
//! | Key / flag                          | Default         | Description                     |
//! |-------------------------------------|-----------------|---------------------------------|
//! | `--config` / `DUNGEON_SYNC_CONFIG`  | *(none)*        | TOML file with `SyncConfig` keys |
//! | `DUNGEON_SYNC_CHUNK_SIZE`           | `8192`          | Payload bytes per chunk         |
//! | `DUNGEON_SYNC_MAX_CHUNKS_PER_TICK`  | `32`            | Per-worker send cap per tick    |
//! | `DUNGEON_SYNC_TICK_RATE_HZ`         | `30`            | Host tick rate                  |
//! | `--control-addr`                    | `0.0.0.0:7400`  | Control listener                |
//! | `--bulk-addr`                       | `0.0.0.0:7401`  | Bulk listener                   |
//! | `--seed`                            | `42`            | Dungeon seed                    |
//! | `--regenerate-every-secs`           | *(off)*         | Periodic live regeneration      |

use anyhow::{Context, Result};
use clap::Parser;
use dungeon_sync::net::{HostServer, HostServerConfig};
use dungeon_sync::{DungeonWorld, Host, JsonWorldCodec, SyncConfig, WorldPayload};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "dungeon-sync-host", about = "Dungeon world transfer host", version)]
struct Args {
    /// Optional TOML file with sync settings
    #[arg(long, env = "DUNGEON_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Control channel listen address
    #[arg(long, env = "DUNGEON_SYNC_CONTROL_ADDR", default_value = "0.0.0.0:7400")]
    control_addr: String,

    /// Bulk channel listen address
    #[arg(long, env = "DUNGEON_SYNC_BULK_ADDR", default_value = "0.0.0.0:7401")]
    bulk_addr: String,

    /// Dungeon seed
    #[arg(long, env = "DUNGEON_SYNC_SEED", default_value_t = 42)]
    seed: u64,

    /// Dungeon extent in voxels (x, y, z)
    #[arg(long, default_value_t = 64)]
    size_x: u32,
    #[arg(long, default_value_t = 16)]
    size_y: u32,
    #[arg(long, default_value_t = 64)]
    size_z: u32,

    /// Override chunk size from the config
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Regenerate the dungeon every N seconds while playing
    #[arg(long, env = "DUNGEON_SYNC_REGENERATE_EVERY_SECS")]
    regenerate_every_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dungeon_sync=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut sync = SyncConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(chunk_size) = args.chunk_size {
        sync.chunk_size = chunk_size;
    }

    let size = (args.size_x, args.size_y, args.size_z);
    log::info!(
        "Starting dungeon-sync-host (seed={}, size={:?}, chunk_size={})",
        args.seed,
        size,
        sync.chunk_size,
    );

    let payload = WorldPayload::new(DungeonWorld::generate(args.seed, size));
    let host = Host::new(sync, Arc::new(JsonWorldCodec), payload).context("Invalid host setup")?;

    let server_config = HostServerConfig {
        control_addr: args.control_addr,
        bulk_addr: args.bulk_addr,
        regenerate_every: args.regenerate_every_secs.map(Duration::from_secs),
        world_size: size,
        seed: args.seed,
        ..Default::default()
    };

    // Run until shutdown
    HostServer::new(server_config, Arc::new(Mutex::new(host)))
        .run()
        .await
}
