//! Core types shared across host and receiver.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Client-chosen unique identifier, stable across control and bulk channels.
pub type ClientId = String;

/// Content identifier of a world structure (md5 hex of its encoding).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldId(pub String);

impl WorldId {
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to tell worlds apart in logs.
        let short: String = self.0.chars().take(8).collect();
        f.write_str(&short)
    }
}

// ---------------------------------------------------------------------------
// Host phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPhase {
    /// Transfer workers are streaming the snapshot.
    MapTransfer,
    /// All workers retired; waiting for every receiver to announce Complete.
    WaitForClientsToBeReady,
    Playing,
}

impl std::fmt::Display for HostPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HostPhase::MapTransfer => "MapTransferState",
            HostPhase::WaitForClientsToBeReady => "WaitForClientsToBeReadyState",
            HostPhase::Playing => "PlayingState",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Stats & config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStats {
    pub phase: HostPhase,
    pub connected_clients: usize,
    pub active_workers: usize,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub rounds_completed: u64,
    pub regeneration_id: i64,
    pub total_ticks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Payload bytes per chunk.
    pub chunk_size: usize,
    /// Upper bound on chunks a single worker emits per tick.
    pub max_chunks_per_tick: usize,
    /// Outgoing buffer size of one bulk channel, in bytes.
    pub bulk_buffer_capacity: usize,
    /// Fraction of `bulk_buffer_capacity` at which sending pauses.
    pub high_water_mark: f32,
    /// Interval between `AllClientProgress` broadcasts.
    pub progress_interval_ms: u64,
    /// Receiver re-announces its Complete state this often while waiting.
    pub retry_interval_ms: u64,
    /// Re-announcements before the receiver declares the host stalled.
    pub max_retries: u32,
    /// Once stalled, one error line per this many milliseconds.
    pub receiver_timeout_ms: u64,
    /// Host waits this long between bulk/control correlation attempts.
    pub identification_retry_ms: u64,
    pub identification_max_attempts: u32,
    pub tick_rate_hz: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            max_chunks_per_tick: 32,
            bulk_buffer_capacity: 1024 * 1024,
            high_water_mark: 0.75,
            progress_interval_ms: 100,
            retry_interval_ms: 3000,
            max_retries: 5,
            receiver_timeout_ms: 30_000,
            identification_retry_ms: 250,
            identification_max_attempts: 20,
            tick_rate_hz: 30.0,
        }
    }
}

impl SyncConfig {
    /// Defaults, then the optional TOML file, then `DUNGEON_SYNC_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg: SyncConfig = builder
            .add_source(config::Environment::with_prefix("DUNGEON_SYNC").try_parsing(true))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SyncError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.max_chunks_per_tick == 0 {
            return Err(SyncError::InvalidConfig(
                "max_chunks_per_tick must be > 0".into(),
            ));
        }
        if !(self.high_water_mark > 0.0 && self.high_water_mark <= 1.0) {
            return Err(SyncError::InvalidConfig(format!(
                "high_water_mark {} outside (0, 1]",
                self.high_water_mark
            )));
        }
        if self.bulk_buffer_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "bulk_buffer_capacity must be > 0".into(),
            ));
        }
        if self.tick_rate_hz <= 0.0 {
            return Err(SyncError::InvalidConfig("tick_rate_hz must be > 0".into()));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn receiver_timeout(&self) -> Duration {
        Duration::from_millis(self.receiver_timeout_ms)
    }

    pub fn identification_retry(&self) -> Duration {
        Duration::from_millis(self.identification_retry_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_rate_hz)
    }

    /// Bytes of queued bulk output at which a worker stops sending.
    pub fn high_water_bytes(&self) -> usize {
        (self.bulk_buffer_capacity as f64 * self.high_water_mark as f64) as usize
    }
}
