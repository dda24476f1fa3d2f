//! Join-path state machine.
//!
//! Driven from two directions: host messages and chunks push events in
//! (`on_begin`, `on_chunk`, `on_transfer_complete`), and [`tick`] advances
//! the phases that do work over time (Dispose, ConnectBulk, Reassembly,
//! BuildAssets, the Complete-phase retry).
//!
//! [`tick`]: ReceiverStateMachine::tick

use super::dispatch::BuildJob;
use super::phase::{join_next, JoinEvent, JoinPhase};
use super::{ReceiverContext, ReceiverEvent};
use crate::error::{Result, SyncError};
use crate::framer::{AssemblyStatus, ChunkAssembly};
use crate::protocol::{MapChunk, MapTransferBegin, MapTransferComplete};
use crate::transport::BulkStatus;
use crate::types::{SyncConfig, WorldId};
use crate::world::WorldPayload;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

pub struct ReceiverStateMachine {
    config: SyncConfig,
    phase: JoinPhase,
    held_world: Option<WorldId>,
    begin: Option<MapTransferBegin>,
    assembly: Option<ChunkAssembly>,
    assembled: Option<Bytes>,
    payload: Option<Arc<WorldPayload>>,
    build: Option<BuildJob>,
    bulk_open: bool,
    gameplay_paused: bool,
    failure: Option<String>,

    // Complete-phase wait
    host_released: bool,
    since_announce: Duration,
    retries: u32,
    stalled: bool,
    since_stall_report: Duration,
    stall_reports: u32,

    events: Vec<ReceiverEvent>,
}

impl ReceiverStateMachine {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            phase: JoinPhase::Idle,
            held_world: None,
            begin: None,
            assembly: None,
            assembled: None,
            payload: None,
            build: None,
            bulk_open: false,
            gameplay_paused: false,
            failure: None,
            host_released: false,
            since_announce: Duration::ZERO,
            retries: 0,
            stalled: false,
            since_stall_report: Duration::ZERO,
            stall_reports: 0,
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> JoinPhase {
        self.phase
    }

    pub fn held_world(&self) -> Option<&WorldId> {
        self.held_world.as_ref()
    }

    /// Last successfully decoded world.
    pub fn world(&self) -> Option<&Arc<WorldPayload>> {
        self.payload.as_ref()
    }

    pub fn transfer_id(&self) -> Option<&str> {
        self.begin.as_ref().map(|b| b.transfer_id.as_str())
    }

    /// Position updates and input are suspended while the bulk channel is
    /// in use.
    pub fn gameplay_paused(&self) -> bool {
        self.gameplay_paused
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn host_released(&self) -> bool {
        self.host_released
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// How many times the persistent-stall error has been logged.
    pub fn stall_reports(&self) -> u32 {
        self.stall_reports
    }

    pub fn received_chunks(&self) -> Option<(u32, u32)> {
        self.assembly.as_ref().map(|a| (a.received(), a.total()))
    }

    pub fn drain_events(&mut self) -> Vec<ReceiverEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Host → receiver
    // -----------------------------------------------------------------------

    pub fn on_begin(&mut self, ctx: &mut ReceiverContext, begin: MapTransferBegin) -> Result<()> {
        if self.phase.in_progress() && self.transfer_id() == Some(begin.transfer_id.as_str()) {
            let err = SyncError::DuplicateBegin(begin.transfer_id);
            warn!("{}", err);
            self.fail(ctx, err.to_string());
            return Err(err);
        }
        let assembly = match ChunkAssembly::for_begin(&begin) {
            Ok(a) => a,
            Err(e) => {
                warn!("{}", e);
                return Err(e);
            }
        };
        if self.phase.in_progress() {
            info!(
                "Transfer {} superseded by {}",
                self.transfer_id().unwrap_or("?"),
                begin.transfer_id
            );
        }

        info!(
            "Transfer {} announced: world {}, {} chunks, {} bytes",
            begin.transfer_id, begin.world_id, begin.total_chunks, begin.total_size_bytes
        );
        self.begin = Some(begin);
        self.failure = None;
        self.transition(ctx, JoinEvent::Begin);
        self.resolve_initiated(ctx, assembly);
        Ok(())
    }

    pub fn on_chunk(&mut self, ctx: &mut ReceiverContext, chunk: &MapChunk) -> Result<()> {
        if self.phase != JoinPhase::Transfer {
            debug!(
                "Dropping chunk {} of {} in phase {}",
                chunk.chunk_index, chunk.transfer_id, self.phase
            );
            return Ok(());
        }
        let Some(assembly) = self.assembly.as_mut() else {
            return Ok(());
        };
        if chunk.transfer_id != assembly.transfer_id() {
            debug!(
                "Dropping stale chunk for {} (assembling {})",
                chunk.transfer_id,
                assembly.transfer_id()
            );
            return Ok(());
        }

        match assembly.accept(chunk) {
            Ok(AssemblyStatus::Pending { received, total }) => {
                self.events.push(ReceiverEvent::Progress { received, total });
            }
            Ok(AssemblyStatus::Ignored) => {}
            Ok(AssemblyStatus::Complete(bytes)) => {
                let total = assembly.total();
                self.events.push(ReceiverEvent::Progress {
                    received: total,
                    total,
                });
                debug!("Assembled {} bytes", bytes.len());
                self.assembled = Some(bytes);
                self.transition(ctx, JoinEvent::Assembled);
            }
            Err(e) => {
                warn!("Protocol violation: {}", e);
                self.fail(ctx, e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn on_transfer_complete(&mut self, msg: &MapTransferComplete) {
        if self.phase != JoinPhase::Complete || self.transfer_id() != Some(msg.transfer_id.as_str()) {
            debug!(
                "Ignoring completion of {} in phase {}",
                msg.transfer_id, self.phase
            );
            return;
        }
        if self.host_released {
            return;
        }
        if self.stalled {
            info!("Host acknowledged {} after stall", msg.transfer_id);
        } else {
            info!("Host released gameplay for {}", msg.transfer_id);
        }
        self.host_released = true;
        self.stalled = false;
        self.events.push(ReceiverEvent::HostReleased {
            transfer_id: msg.transfer_id.clone(),
        });
    }

    /// Take over a world delivered by the regeneration path, then wait for
    /// the host's acknowledgment like after a join.
    pub fn adopt_world(&mut self, world_id: WorldId, begin: MapTransferBegin, payload: Arc<WorldPayload>) {
        self.held_world = Some(world_id);
        self.begin = Some(begin);
        self.payload = Some(payload);
        self.phase = JoinPhase::Complete;
        self.reset_wait();
    }

    /// Forget the held world, e.g. after its resources were released by a
    /// failed regeneration.
    pub fn abandon_world(&mut self) {
        self.held_world = None;
        self.payload = None;
    }

    /// The control channel to the host is gone. Whatever was in flight is
    /// dropped without announcing; the held world survives only if it was
    /// never disposed. The next begin on the new connection restarts the
    /// join from Initiated.
    pub fn connection_lost(&mut self, ctx: &mut ReceiverContext) {
        let prev = self.phase;
        if prev == JoinPhase::Idle {
            return;
        }
        warn!("Connection to host lost in phase {}", prev);
        self.exit(ctx, prev, JoinPhase::Idle);
        self.phase = JoinPhase::Idle;
        self.begin = None;
        self.reset_wait();
        self.events.push(ReceiverEvent::Phase {
            from: prev.as_str(),
            to: JoinPhase::Idle.as_str(),
        });
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub fn tick(&mut self, ctx: &mut ReceiverContext, dt: Duration) {
        match self.phase {
            JoinPhase::Dispose => {
                if let Err(e) = ctx.builder.dispose() {
                    error!("Dispose failed, continuing: {}", e);
                }
                self.held_world = None;
                self.payload = None;
                self.transition(ctx, JoinEvent::Disposed);
            }
            JoinPhase::ConnectBulk => match ctx.connector.status() {
                BulkStatus::Connected => {
                    self.transition(ctx, JoinEvent::BulkConnected);
                }
                BulkStatus::Failed(reason) => {
                    error!("Bulk channel handshake failed: {}", reason);
                    self.fail(ctx, SyncError::BulkChannel(reason).to_string());
                }
                BulkStatus::Idle => {
                    self.bulk_open = false;
                    error!("Bulk channel closed during handshake");
                    self.fail(ctx, SyncError::BulkChannel("closed during handshake".into()).to_string());
                }
                BulkStatus::Pending => {}
            },
            JoinPhase::Transfer => match ctx.connector.status() {
                BulkStatus::Failed(reason) => {
                    error!("Bulk channel lost mid-transfer: {}", reason);
                    self.fail(ctx, SyncError::BulkChannel(reason).to_string());
                }
                BulkStatus::Idle => {
                    self.bulk_open = false;
                    error!("Bulk channel closed mid-transfer");
                    self.fail(ctx, SyncError::BulkChannel("closed mid-transfer".into()).to_string());
                }
                BulkStatus::Pending | BulkStatus::Connected => {}
            },
            JoinPhase::Reassembly => self.decode(ctx),
            JoinPhase::BuildAssets => self.poll_build(ctx),
            JoinPhase::Complete => self.wait_for_host(ctx, dt),
            JoinPhase::Idle | JoinPhase::Initiated | JoinPhase::Failed => {}
        }
    }

    fn resolve_initiated(&mut self, ctx: &mut ReceiverContext, assembly: ChunkAssembly) {
        let Some(begin) = self.begin.as_ref() else {
            return;
        };
        let incoming = WorldId(begin.world_id.clone());
        if self.held_world.as_ref() == Some(&incoming) {
            info!("Already holding world {}; skipping download", incoming);
            self.transition(ctx, JoinEvent::WorldMatched);
            return;
        }

        self.assembly = Some(assembly);
        self.transition(ctx, JoinEvent::WorldDiffers);
    }

    fn decode(&mut self, ctx: &mut ReceiverContext) {
        let Some(bytes) = self.assembled.take() else {
            self.fail(ctx, "reassembly entered without data".into());
            return;
        };
        match ctx.codec.decode(&bytes) {
            Ok(payload) => {
                debug!(
                    "Decoded world seed {} with {} entities",
                    payload.world.seed,
                    payload.entities.len()
                );
                self.payload = Some(Arc::new(payload));
                self.transition(ctx, JoinEvent::Decoded);
            }
            Err(e) => {
                error!("World data corrupt after full transfer: {}", e);
                self.fail(ctx, e.to_string());
            }
        }
    }

    fn poll_build(&mut self, ctx: &mut ReceiverContext) {
        let Some(job) = self.build.as_ref() else {
            return;
        };
        match job.poll() {
            None => {}
            Some(Ok(())) => {
                self.build = None;
                self.transition(ctx, JoinEvent::Built);
            }
            Some(Err(e)) => {
                self.build = None;
                error!("{}", e);
                self.fail(ctx, e.to_string());
            }
        }
    }

    fn wait_for_host(&mut self, ctx: &mut ReceiverContext, dt: Duration) {
        if self.host_released {
            return;
        }
        if self.stalled {
            self.since_stall_report += dt;
            if self.since_stall_report >= self.config.receiver_timeout() {
                self.since_stall_report = Duration::ZERO;
                self.report_stall();
            }
            return;
        }

        self.since_announce += dt;
        if self.since_announce < self.config.retry_interval() {
            return;
        }
        self.since_announce = Duration::ZERO;

        if self.retries < self.config.max_retries {
            self.retries += 1;
            warn!(
                "Host has not acknowledged readiness; re-announcing Complete ({}/{})",
                self.retries, self.config.max_retries
            );
            let complete = JoinPhase::Complete.as_str();
            let transfer_id = self.begin.as_ref().map(|b| b.transfer_id.clone());
            ctx.announce(complete, complete, transfer_id.as_deref());
        } else {
            self.stalled = true;
            self.since_stall_report = Duration::ZERO;
            self.events.push(ReceiverEvent::Stalled);
            self.report_stall();
        }
    }

    fn report_stall(&mut self) {
        self.stall_reports += 1;
        error!(
            "Host never acknowledged transfer {} after {} re-announcements; waiting for operator",
            self.transfer_id().unwrap_or("?"),
            self.retries
        );
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn fail(&mut self, ctx: &mut ReceiverContext, reason: String) {
        self.failure = Some(reason);
        self.transition(ctx, JoinEvent::Fault);
    }

    /// Take the transition for `event`: exit hook of the current phase,
    /// announcement, then entry hook of the next one.
    fn transition(&mut self, ctx: &mut ReceiverContext, event: JoinEvent) -> bool {
        let Some(next) = join_next(self.phase, event) else {
            warn!("Event {:?} not valid in phase {}; dropped", event, self.phase);
            return false;
        };
        let prev = self.phase;
        self.exit(ctx, prev, next);
        self.phase = next;
        info!("Receiver phase {} -> {}", prev, next);
        let transfer_id = self.begin.as_ref().map(|b| b.transfer_id.clone());
        ctx.announce(prev.as_str(), next.as_str(), transfer_id.as_deref());
        self.events.push(ReceiverEvent::Phase {
            from: prev.as_str(),
            to: next.as_str(),
        });
        self.enter(ctx, prev, next);
        true
    }

    /// Release what `prev` owned. The bulk channel is held from ConnectBulk
    /// through BuildAssets; leaving that span for anything else closes it
    /// and lifts the gameplay pause.
    fn exit(&mut self, ctx: &mut ReceiverContext, prev: JoinPhase, next: JoinPhase) {
        match prev {
            JoinPhase::Transfer => self.assembly = None,
            JoinPhase::Reassembly => self.assembled = None,
            JoinPhase::BuildAssets => self.build = None,
            JoinPhase::Complete => self.reset_wait(),
            JoinPhase::Idle
            | JoinPhase::Initiated
            | JoinPhase::Dispose
            | JoinPhase::ConnectBulk
            | JoinPhase::Failed => {}
        }
        if !holds_bulk(next) {
            self.close_bulk(ctx);
            self.gameplay_paused = false;
        }
    }

    fn enter(&mut self, ctx: &mut ReceiverContext, prev: JoinPhase, phase: JoinPhase) {
        match phase {
            JoinPhase::ConnectBulk => {
                self.gameplay_paused = true;
                self.bulk_open = true;
                if let Err(e) = ctx.connector.begin_connect(ctx.identity.clone()) {
                    error!("Cannot open bulk channel: {}", e);
                    self.fail(ctx, e.to_string());
                }
            }
            JoinPhase::BuildAssets => {
                if let Some(payload) = self.payload.clone() {
                    self.build = Some(BuildJob::spawn(
                        ctx.dispatcher.as_ref(),
                        ctx.builder.clone(),
                        payload,
                        false,
                    ));
                }
            }
            JoinPhase::Complete => {
                self.reset_wait();
                if let Some(begin) = &self.begin {
                    let world_id = WorldId(begin.world_id.clone());
                    self.held_world = Some(world_id.clone());
                    self.events.push(ReceiverEvent::WorldReady {
                        world_id,
                        skipped: prev == JoinPhase::Initiated,
                    });
                }
            }
            JoinPhase::Failed => {
                let reason = self.failure.clone().unwrap_or_default();
                error!("World transfer failed: {}", reason);
                self.events.push(ReceiverEvent::Failed { reason });
            }
            JoinPhase::Initiated => {
                self.assembly = None;
                self.reset_wait();
            }
            JoinPhase::Idle | JoinPhase::Dispose | JoinPhase::Transfer | JoinPhase::Reassembly => {}
        }
    }

    fn close_bulk(&mut self, ctx: &mut ReceiverContext) {
        if self.bulk_open {
            ctx.connector.close();
            self.bulk_open = false;
        }
    }

    fn reset_wait(&mut self) {
        self.host_released = false;
        self.since_announce = Duration::ZERO;
        self.retries = 0;
        self.stalled = false;
        self.since_stall_report = Duration::ZERO;
    }
}

fn holds_bulk(phase: JoinPhase) -> bool {
    matches!(
        phase,
        JoinPhase::ConnectBulk | JoinPhase::Transfer | JoinPhase::Reassembly | JoinPhase::BuildAssets
    )
}
