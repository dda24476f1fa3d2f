//! Regeneration path: the world changes while the receiver is already
//! playing.
//!
//! | Phase       | Work                                         | Progress  |
//! |-------------|----------------------------------------------|-----------|
//! | Cleanup     | release old resources, send `ReadyForMap`    | 0.0 – 0.1 |
//! | Downloading | collect chunks on the bulk channel           | 0.1 – 0.9 |
//! | Rebuilding  | build the new world, reinitialize entities   | 0.9 – 1.0 |
//! | Complete    | notify listeners, go inactive                | 1.0       |
//!
//! Every mutating call checks that the coordinator is active and in the
//! phase the call belongs to; anything else is logged and dropped, so a
//! draining regeneration cannot leak into the next one. Failures in any
//! step end in `Failed` with an `on_error` notification.

use super::dispatch::BuildJob;
use super::phase::{regen_allows, regen_progress, RegenPhase};
use super::{ReceiverContext, ReceiverEvent};
use crate::error::SyncError;
use crate::framer::{AssemblyStatus, ChunkAssembly};
use crate::protocol::{ClientReadyForMap, MapChunk, MapTransferBegin, ReceiverMessage};
use crate::transport::BulkStatus;
use crate::types::WorldId;
use crate::world::WorldPayload;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Observer of regeneration progress (loading screen, telemetry).
pub trait RegenerationListener: Send {
    fn on_phase(&mut self, _regeneration_id: i64, _phase: RegenPhase) {}
    fn on_progress(&mut self, _regeneration_id: i64, _progress: f32) {}
    fn on_complete(&mut self, _regeneration_id: i64) {}
    fn on_error(&mut self, _regeneration_id: i64, _error: &str) {}
}

/// How the last regeneration ended.
#[derive(Debug, Clone)]
pub enum RegenOutcome {
    Completed {
        world_id: WorldId,
        begin: MapTransferBegin,
        payload: Arc<WorldPayload>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Default)]
pub struct RegenerationCoordinator {
    phase: RegenPhase,
    active: bool,
    regeneration_id: i64,
    begin: Option<MapTransferBegin>,
    assembly: Option<ChunkAssembly>,
    chunks_received: u32,
    bytes_received: u64,
    payload: Option<Arc<WorldPayload>>,
    build: Option<BuildJob>,
    bulk_open: bool,
    progress: f32,
    listeners: Vec<Box<dyn RegenerationListener>>,
    outcome: Option<RegenOutcome>,
    events: Vec<ReceiverEvent>,
}

impl RegenerationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Box<dyn RegenerationListener>) {
        self.listeners.push(listener);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn phase(&self) -> RegenPhase {
        self.phase
    }

    pub fn regeneration_id(&self) -> i64 {
        self.regeneration_id
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn chunks_received(&self) -> u32 {
        self.chunks_received
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn take_outcome(&mut self) -> Option<RegenOutcome> {
        self.outcome.take()
    }

    pub fn drain_events(&mut self) -> Vec<ReceiverEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Begin regeneration `regeneration_id`: clean up, acknowledge, then
    /// open the bulk channel for the download.
    pub fn start(&mut self, ctx: &mut ReceiverContext, regeneration_id: i64) {
        if self.active {
            warn!(
                "Regeneration {} superseded by {} in phase {}",
                self.regeneration_id, regeneration_id, self.phase
            );
            self.close_bulk(ctx);
        }
        self.active = true;
        self.regeneration_id = regeneration_id;
        self.begin = None;
        self.assembly = None;
        self.chunks_received = 0;
        self.bytes_received = 0;
        self.payload = None;
        self.build = None;
        self.outcome = None;
        self.progress = 0.0;
        self.phase = RegenPhase::Idle;

        info!("Regeneration {} started", regeneration_id);
        if !self.enter(ctx, RegenPhase::Cleanup) {
            return;
        }

        if let Err(e) = ctx.builder.dispose() {
            self.fail(ctx, format!("cleanup failed: {}", e));
            return;
        }
        let ack = ReceiverMessage::ReadyForMap(ClientReadyForMap {
            client_id: ctx.identity.client_unique_id.clone(),
            regeneration_id,
            timestamp: now_millis(),
        });
        if let Err(e) = ctx.send(ack) {
            warn!("ReadyForMap for regeneration {} not sent: {}", regeneration_id, e);
        }
        self.report_progress(1.0);

        if !self.enter(ctx, RegenPhase::Downloading) {
            return;
        }
        self.bulk_open = true;
        if let Err(e) = ctx.connector.begin_connect(ctx.identity.clone()) {
            self.fail(ctx, SyncError::BulkChannel(e.to_string()).to_string());
        }
    }

    pub fn on_begin(&mut self, ctx: &mut ReceiverContext, begin: MapTransferBegin) {
        if !self.guard("transfer begin", RegenPhase::Downloading) {
            return;
        }
        if let Some(current) = &self.begin {
            if current.transfer_id == begin.transfer_id {
                warn!(
                    "Regeneration {} already downloading {}; duplicate begin dropped",
                    self.regeneration_id, current.transfer_id
                );
                return;
            }
            // The host restarted its round (late joiner); the old stream is dead.
            info!(
                "Regeneration {}: transfer {} superseded by {}",
                self.regeneration_id, current.transfer_id, begin.transfer_id
            );
            self.chunks_received = 0;
            self.bytes_received = 0;
            self.report_progress(0.0);
        }
        match ChunkAssembly::for_begin(&begin) {
            Ok(a) => {
                debug!(
                    "Regeneration {} downloading {} ({} chunks)",
                    self.regeneration_id, begin.transfer_id, begin.total_chunks
                );
                self.assembly = Some(a);
                self.begin = Some(begin);
            }
            Err(e) => self.fail(ctx, e.to_string()),
        }
    }

    pub fn on_chunk(&mut self, ctx: &mut ReceiverContext, chunk: &MapChunk) {
        if !self.guard("chunk", RegenPhase::Downloading) {
            return;
        }
        let Some(assembly) = self.assembly.as_mut() else {
            debug!("Chunk before begin in regeneration {}; dropped", self.regeneration_id);
            return;
        };
        if chunk.transfer_id != assembly.transfer_id() {
            debug!("Stale chunk for {}; dropped", chunk.transfer_id);
            return;
        }

        match assembly.accept(chunk) {
            Ok(AssemblyStatus::Ignored) => {}
            Ok(AssemblyStatus::Pending { received, total }) => {
                self.chunks_received += 1;
                self.bytes_received += chunk.payload.len() as u64;
                self.report_progress(received as f32 / total as f32);
            }
            Ok(AssemblyStatus::Complete(bytes)) => {
                self.chunks_received += 1;
                self.bytes_received += chunk.payload.len() as u64;
                self.report_progress(1.0);
                self.close_bulk(ctx);
                match ctx.codec.decode(&bytes) {
                    Ok(payload) => self.rebuild(ctx, Arc::new(payload)),
                    Err(e) => self.fail(ctx, format!("world data corrupt: {}", e)),
                }
            }
            Err(e) => self.fail(ctx, e.to_string()),
        }
    }

    pub fn tick(&mut self, ctx: &mut ReceiverContext) {
        if !self.active {
            return;
        }
        match self.phase {
            RegenPhase::Downloading => match ctx.connector.status() {
                BulkStatus::Failed(reason) => {
                    self.fail(ctx, SyncError::BulkChannel(reason).to_string());
                }
                BulkStatus::Idle if self.bulk_open => {
                    self.bulk_open = false;
                    self.fail(ctx, SyncError::BulkChannel("closed mid-download".into()).to_string());
                }
                _ => {}
            },
            RegenPhase::Rebuilding => {
                let Some(result) = self.build.as_ref().and_then(|job| job.poll()) else {
                    return;
                };
                self.build = None;
                match result {
                    Ok(()) => self.complete(ctx),
                    Err(e) => self.fail(ctx, format!("rebuild failed: {}", e)),
                }
            }
            _ => {}
        }
    }

    /// The control channel to the host is gone. Ends an active regeneration
    /// as failed without announcing anything to the host.
    pub fn abort(&mut self, ctx: &mut ReceiverContext, reason: &str) {
        if !self.active {
            return;
        }
        error!(
            "Regeneration {} aborted in phase {}: {}",
            self.regeneration_id, self.phase, reason
        );
        self.close_bulk(ctx);
        self.build = None;
        self.assembly = None;
        self.begin = None;
        self.payload = None;
        self.phase = RegenPhase::Failed;
        self.active = false;
        for l in &mut self.listeners {
            l.on_phase(self.regeneration_id, RegenPhase::Failed);
            l.on_error(self.regeneration_id, reason);
        }
        self.events.push(ReceiverEvent::Failed {
            reason: reason.to_string(),
        });
        self.outcome = Some(RegenOutcome::Failed {
            reason: reason.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn rebuild(&mut self, ctx: &mut ReceiverContext, payload: Arc<WorldPayload>) {
        if !self.enter(ctx, RegenPhase::Rebuilding) {
            return;
        }
        self.report_progress(0.0);
        self.payload = Some(payload.clone());
        self.build = Some(BuildJob::spawn(
            ctx.dispatcher.as_ref(),
            ctx.builder.clone(),
            payload,
            true,
        ));
    }

    fn complete(&mut self, ctx: &mut ReceiverContext) {
        if !self.enter(ctx, RegenPhase::Complete) {
            return;
        }
        self.progress = 1.0;
        self.active = false;
        let (Some(begin), Some(payload)) = (self.begin.take(), self.payload.take()) else {
            return;
        };
        let world_id = WorldId(begin.world_id.clone());
        info!(
            "Regeneration {} complete: world {}",
            self.regeneration_id, world_id
        );
        for l in &mut self.listeners {
            l.on_progress(self.regeneration_id, 1.0);
            l.on_complete(self.regeneration_id);
        }
        self.events.push(ReceiverEvent::WorldReady {
            world_id: world_id.clone(),
            skipped: false,
        });
        self.outcome = Some(RegenOutcome::Completed {
            world_id,
            begin,
            payload,
        });
    }

    fn fail(&mut self, ctx: &mut ReceiverContext, reason: String) {
        error!("Regeneration {} failed: {}", self.regeneration_id, reason);
        self.close_bulk(ctx);
        self.build = None;
        self.assembly = None;
        self.enter(ctx, RegenPhase::Failed);
        self.active = false;
        for l in &mut self.listeners {
            l.on_error(self.regeneration_id, &reason);
        }
        self.events.push(ReceiverEvent::Failed {
            reason: reason.clone(),
        });
        self.outcome = Some(RegenOutcome::Failed { reason });
    }

    /// Move to `next`, announcing it to the host and listeners.
    fn enter(&mut self, ctx: &mut ReceiverContext, next: RegenPhase) -> bool {
        if !regen_allows(self.phase, next) {
            warn!(
                "Regeneration {}: {} -> {} not allowed; dropped",
                self.regeneration_id, self.phase, next
            );
            return false;
        }
        let prev = std::mem::replace(&mut self.phase, next);
        info!("Regeneration phase {} -> {}", prev, next);
        let transfer_id = self.begin.as_ref().map(|b| b.transfer_id.as_str());
        ctx.announce(prev.as_str(), next.as_str(), transfer_id);
        for l in &mut self.listeners {
            l.on_phase(self.regeneration_id, next);
        }
        self.events.push(ReceiverEvent::Phase {
            from: prev.as_str(),
            to: next.as_str(),
        });
        true
    }

    fn guard(&self, op: &str, expected: RegenPhase) -> bool {
        if !self.active {
            warn!("{} while no regeneration is active; dropped", op);
            return false;
        }
        if self.phase != expected {
            warn!(
                "{} in phase {} of regeneration {} (expected {}); dropped",
                op, self.phase, self.regeneration_id, expected
            );
            return false;
        }
        true
    }

    fn report_progress(&mut self, fraction: f32) {
        self.progress = regen_progress(self.phase, fraction);
        for l in &mut self.listeners {
            l.on_progress(self.regeneration_id, self.progress);
        }
    }

    fn close_bulk(&mut self, ctx: &mut ReceiverContext) {
        if self.bulk_open {
            ctx.connector.close();
            self.bulk_open = false;
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
