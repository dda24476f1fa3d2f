//! Per-receiver transfer worker: begin message, paced chunk emission,
//! completion detection.

use crate::error::Result;
use crate::framer;
use crate::host::link::ClientLink;
use crate::protocol::{phases, HostMessage, MapTransferBegin};
use crate::types::SyncConfig;
use crate::world::WorldSnapshot;
use log::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Begin message not sent yet (receiver not identified).
    Idle,
    Streaming,
    Complete,
}

/// Outcome of one [`TransferWorker::update`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerTick {
    pub chunks_sent: usize,
    pub bytes_sent: usize,
    /// Stopped early because the bulk buffer reached the high-water mark.
    pub throttled: bool,
}

pub struct TransferWorker {
    transfer_id: String,
    snapshot: WorldSnapshot,
    chunk_size: usize,
    total_chunks: u32,
    next_index: u32,
    state: WorkerState,
    skipped: bool,
    regeneration_id: i64,
}

impl TransferWorker {
    pub fn new(transfer_id: impl Into<String>, snapshot: WorldSnapshot, chunk_size: usize) -> Self {
        let total_chunks = framer::chunk_count(snapshot.len(), chunk_size);
        Self {
            transfer_id: transfer_id.into(),
            snapshot,
            chunk_size,
            total_chunks,
            next_index: 0,
            state: WorkerState::Idle,
            skipped: false,
            regeneration_id: 0,
        }
    }

    /// Regeneration this round belongs to. A receiver on the regeneration
    /// path is streamed to only after acknowledging it with `ReadyForMap`.
    pub fn with_regeneration(mut self, regeneration_id: i64) -> Self {
        self.regeneration_id = regeneration_id;
        self
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == WorkerState::Complete
    }

    /// Receiver already held this world; nothing was sent.
    pub fn skipped(&self) -> bool {
        self.skipped
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Chunks handed to the bulk channel so far.
    pub fn chunks_sent(&self) -> u32 {
        self.next_index
    }

    /// Send the begin message. Returns `Ok(false)` while the receiver has not
    /// identified itself yet; the caller retries next tick.
    pub fn start(&mut self, link: &mut ClientLink) -> Result<bool> {
        if self.state != WorkerState::Idle {
            return Ok(true);
        }
        if link.identity().is_none() {
            debug!(
                "Transfer {} waiting for {} to identify",
                self.transfer_id,
                link.label()
            );
            return Ok(false);
        }

        link.send(HostMessage::TransferBegin(MapTransferBegin {
            transfer_id: self.transfer_id.clone(),
            world_id: self.snapshot.world_id.0.clone(),
            total_chunks: self.total_chunks as i32,
            total_size_bytes: self.snapshot.len() as i64,
        }))?;
        link.set_transfer_id(self.transfer_id.clone());

        info!(
            "Transfer {} started for {} ({} chunks, {} bytes)",
            self.transfer_id,
            link.label(),
            self.total_chunks,
            self.snapshot.len()
        );
        self.state = WorkerState::Streaming;
        Ok(true)
    }

    /// Advance the send loop by one tick.
    pub fn update(&mut self, link: &mut ClientLink, config: &SyncConfig) -> Result<WorkerTick> {
        let mut tick = WorkerTick::default();
        match self.state {
            WorkerState::Complete => return Ok(tick),
            WorkerState::Idle => {
                self.start(link)?;
                return Ok(tick);
            }
            WorkerState::Streaming => {}
        }

        // Must run before the bulk wait: a skipping receiver never opens one.
        // Only a Complete made for this transfer counts; a late re-announcement
        // from an earlier round names another transfer.
        if self.next_index == 0
            && link.announced_phase() == Some(phases::COMPLETE)
            && link.announced_transfer() == Some(self.transfer_id.as_str())
        {
            info!(
                "{} already holds world {}; transfer {} skipped",
                link.label(),
                self.snapshot.world_id,
                self.transfer_id
            );
            self.skipped = true;
            self.state = WorkerState::Complete;
            return Ok(tick);
        }

        if !link.bulk_connected() {
            return Ok(tick);
        }
        if !self.receiver_ready(link) {
            return Ok(tick);
        }

        let high_water = config.high_water_bytes();
        while self.next_index < self.total_chunks {
            if tick.chunks_sent >= config.max_chunks_per_tick {
                break;
            }
            if link.bulk_buffered_bytes() >= high_water {
                tick.throttled = true;
                break;
            }
            let chunk = framer::chunk_at(
                &self.transfer_id,
                &self.snapshot.bytes,
                self.chunk_size,
                self.next_index,
            );
            tick.bytes_sent += chunk.payload.len();
            link.send_chunk(chunk)?;
            self.next_index += 1;
            tick.chunks_sent += 1;
        }

        if self.next_index == self.total_chunks {
            debug!(
                "Transfer {} sent all {} chunks to {}",
                self.transfer_id,
                self.total_chunks,
                link.label()
            );
            self.state = WorkerState::Complete;
        }
        Ok(tick)
    }

    /// The receiver is waiting for this transfer's chunks: on the join path
    /// it announced Transfer for this transfer id, on the regeneration path
    /// it announced Downloading after acknowledging the current regeneration.
    fn receiver_ready(&self, link: &ClientLink) -> bool {
        let Some(phase) = link.announced_phase().filter(|p| phases::is_receiving(p)) else {
            return false;
        };
        if phase == phases::DOWNLOADING {
            return self.regeneration_id > 0 && link.ready_for_map() == Some(self.regeneration_id);
        }
        link.announced_transfer() == Some(self.transfer_id.as_str())
    }
}
