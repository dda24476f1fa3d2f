//! Host: the authoritative side of world distribution.
//!
//! ```text
//! Host
//!   ├── ClientLink ×N        (link.rs)        control + bulk channel per receiver
//!   ├── TransferCoordinator  (coordinator.rs) snapshot, workers, progress
//!   │     └── TransferWorker (worker.rs)      paced chunk stream per receiver
//!   └── ReadinessBarrier     (barrier.rs)     waits for every receiver Complete
//! ```
//!
//! Phases: `MapTransfer` → `WaitForClientsToBeReady` → `Playing`. A late
//! joiner or a regeneration sends the host back to `MapTransfer`; receivers
//! that already hold the world skip straight to Complete.
//!
//! `Host` is not internally synchronized. The runtime wraps it in one
//! `parking_lot::Mutex` ([`SharedHost`]) so I/O tasks and the tick loop never
//! interleave.

pub mod barrier;
pub mod coordinator;
pub mod link;
pub mod worker;

pub use barrier::{BarrierStatus, ReadinessBarrier};
pub use coordinator::{RoundStatus, TransferCoordinator};
pub use link::{ClientLink, ConnectionId};
pub use worker::{TransferWorker, WorkerState};

use crate::error::{Result, SyncError};
use crate::protocol::{
    phases, ClientIdentification, HostMessage, MapTransferComplete, ReceiverMessage,
    RegenerationStart,
};
use crate::transport::{BulkChannel, ControlChannel};
use crate::types::{HostPhase, SyncConfig, SyncStats};
use crate::world::{WorldCodec, WorldPayload, WorldSnapshot};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub type SharedHost = Arc<Mutex<Host>>;

// ---------------------------------------------------------------------------
// Tick result
// ---------------------------------------------------------------------------

/// What a single [`Host::tick`] did.
#[derive(Debug, Clone, Default)]
pub struct HostTick {
    pub tick: u64,
    pub phase: Option<HostPhase>,
    /// Phase transitions taken during this tick, in order.
    pub transitions: Vec<(HostPhase, HostPhase)>,
    pub chunks_sent: usize,
}

/// Bulk connection whose identity did not match a control connection yet.
struct PendingBulk {
    identification: ClientIdentification,
    bulk: Box<dyn BulkChannel>,
    attempts: u32,
    since_attempt: Duration,
}

pub struct Host {
    config: SyncConfig,
    codec: Arc<dyn WorldCodec>,
    phase: HostPhase,
    payload: WorldPayload,
    links: BTreeMap<ConnectionId, ClientLink>,
    pending_bulk: Vec<PendingBulk>,
    coordinator: TransferCoordinator,
    barrier: ReadinessBarrier,
    regeneration_id: i64,
    next_conn: u64,
    tick_count: u64,
    chunks_sent: u64,
    bytes_sent: u64,
    rounds_completed: u64,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("phase", &self.phase)
            .field("links", &self.links)
            .field("regeneration_id", &self.regeneration_id)
            .field("tick_count", &self.tick_count)
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Create a host for `payload`. The first transfer round starts
    /// immediately (with no receivers it finishes on the first tick).
    pub fn new(config: SyncConfig, codec: Arc<dyn WorldCodec>, payload: WorldPayload) -> Result<Self> {
        config.validate()?;
        let mut host = Self {
            config,
            codec,
            phase: HostPhase::MapTransfer,
            payload,
            links: BTreeMap::new(),
            pending_bulk: Vec::new(),
            coordinator: TransferCoordinator::new(),
            barrier: ReadinessBarrier::new(),
            regeneration_id: 0,
            next_conn: 1,
            tick_count: 0,
            chunks_sent: 0,
            bytes_sent: 0,
            rounds_completed: 0,
        };
        host.enter_map_transfer()?;
        Ok(host)
    }

    pub fn phase(&self) -> HostPhase {
        self.phase
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn payload(&self) -> &WorldPayload {
        &self.payload
    }

    pub fn regeneration_id(&self) -> i64 {
        self.regeneration_id
    }

    pub fn link(&self, conn: ConnectionId) -> Option<&ClientLink> {
        self.links.get(&conn)
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    /// Bulk connections still waiting for a matching control identity.
    pub fn pending_bulk_count(&self) -> usize {
        self.pending_bulk.len()
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Register a new control connection. Identity follows in a
    /// `ClientIdentification` message.
    pub fn connect(&mut self, control: Box<dyn ControlChannel>) -> ConnectionId {
        let conn = ConnectionId(self.next_conn);
        self.next_conn += 1;
        let mut link = ClientLink::new(conn, control);
        info!("{} connected (phase {})", conn, self.phase);

        match self.phase {
            HostPhase::MapTransfer => self.coordinator.spawn(&mut link, &self.config),
            HostPhase::WaitForClientsToBeReady | HostPhase::Playing => {
                self.links.insert(conn, link);
                info!("Late joiner {}; restarting map transfer", conn);
                if let Err(e) = self.enter_map_transfer() {
                    error!("Cannot restart map transfer for late joiner: {}", e);
                }
                return conn;
            }
        }
        self.links.insert(conn, link);
        conn
    }

    /// Offer a freshly opened bulk connection. It is attached immediately if
    /// its identity matches an identified control connection; otherwise the
    /// host retries the match for a bounded time.
    pub fn identify_bulk(&mut self, identification: ClientIdentification, bulk: Box<dyn BulkChannel>) {
        match self.find_identified(&identification.client_unique_id) {
            Some(conn) => self.bind_bulk(conn, bulk),
            None => {
                debug!(
                    "Bulk channel from {} arrived before its identity; holding",
                    identification.client_unique_id
                );
                self.pending_bulk.push(PendingBulk {
                    identification,
                    bulk,
                    attempts: 0,
                    since_attempt: Duration::ZERO,
                });
            }
        }
    }

    /// Connectivity loss on either channel destroys the session. The control
    /// channel is closed too, so the receiver reconnects and starts over.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        if link.is_disconnected() {
            return;
        }
        info!("{} disconnected", link.label());
        link.mark_disconnected();
        self.coordinator.retire(conn);
    }

    /// Bulk connection closed. Receivers close it themselves once they are
    /// Complete; losing it mid-stream destroys the session, since transfers
    /// never resume.
    pub fn bulk_lost(&mut self, client_unique_id: &str) {
        let Some(conn) = self.find_identified(client_unique_id) else {
            return;
        };
        let streaming = self
            .coordinator
            .worker(conn)
            .is_some_and(|w| w.state() == WorkerState::Streaming && w.chunks_sent() > 0);
        if streaming {
            warn!("Bulk channel of {} lost mid-transfer", client_unique_id);
            self.disconnect(conn);
        } else if let Some(link) = self.links.get_mut(&conn) {
            debug!("Bulk channel of {} closed", client_unique_id);
            link.detach_bulk();
        }
    }

    /// Step one of the handshake: bind an identity to a control connection.
    /// Any bulk connection already waiting for that identity is matched.
    pub fn identify_control(&mut self, conn: ConnectionId, identity: ClientIdentification) -> Result<()> {
        let link = self
            .links
            .get_mut(&conn)
            .filter(|l| !l.is_disconnected())
            .ok_or_else(|| SyncError::UnknownClient(conn.to_string()))?;
        if let Some(existing) = link.identity() {
            if existing.client_unique_id != identity.client_unique_id {
                warn!(
                    "{} re-identified as {} (was {}); ignoring",
                    conn, identity.client_unique_id, existing.client_unique_id
                );
            }
            return Ok(());
        }
        info!(
            "{} identified as {} ('{}')",
            conn, identity.client_unique_id, identity.client_name
        );
        link.set_identity(identity);
        self.correlate_pending(Duration::ZERO);
        Ok(())
    }

    pub fn handle_message(&mut self, conn: ConnectionId, msg: ReceiverMessage) -> Result<()> {
        let msg = match msg {
            ReceiverMessage::Identification(identity) => {
                return self.identify_control(conn, identity);
            }
            other => other,
        };
        let regeneration_id = self.regeneration_id;
        let streaming = self
            .coordinator
            .worker(conn)
            .is_some_and(|w| w.state() == WorkerState::Streaming);
        let link = self
            .links
            .get_mut(&conn)
            .filter(|l| !l.is_disconnected())
            .ok_or_else(|| SyncError::UnknownClient(conn.to_string()))?;

        match msg {
            ReceiverMessage::Identification(_) => {}
            ReceiverMessage::StateChange(change) => {
                if let (Some(theirs), Some(ours)) = (change.transfer_id.as_deref(), link.transfer_id()) {
                    if theirs != ours {
                        debug!(
                            "{}: late {} -> {} for {} (current {}); ignored",
                            link.label(),
                            change.old_phase,
                            change.new_phase,
                            theirs,
                            ours
                        );
                        return Ok(());
                    }
                }
                info!(
                    "{}: {} -> {}",
                    link.label(),
                    change.old_phase,
                    change.new_phase
                );
                let abandoned = streaming
                    && change.new_phase == phases::FAILED
                    && (phases::is_receiving(&change.old_phase) || change.old_phase == phases::CONNECT_BULK);
                link.set_announced_phase(change.new_phase, change.transfer_id);
                if abandoned {
                    warn!("{} abandoned its download mid-stream", link.label());
                    self.disconnect(conn);
                }
            }
            ReceiverMessage::ReadyForMap(ready) => {
                if ready.regeneration_id != regeneration_id {
                    warn!(
                        "{} acknowledged regeneration {} but current is {}",
                        link.label(),
                        ready.regeneration_id,
                        regeneration_id
                    );
                    return Ok(());
                }
                debug!("{} ready for regeneration {}", link.label(), ready.regeneration_id);
                link.set_ready_for_map(ready.regeneration_id);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // World changes
    // -----------------------------------------------------------------------

    /// Replace the world without notifying playing receivers of a
    /// regeneration (initial publish, late-join recapture).
    pub fn publish_world(&mut self, payload: WorldPayload) -> Result<()> {
        self.payload = payload;
        self.enter_map_transfer()
    }

    /// Live world change: receivers run their regeneration path, then the
    /// complete world is re-sent.
    pub fn regenerate(&mut self, mut payload: WorldPayload) -> Result<i64> {
        self.regeneration_id += 1;
        payload.world.generation = self.regeneration_id as u64;
        info!(
            "Regeneration {} (seed {})",
            self.regeneration_id, payload.world.seed
        );

        let msg = HostMessage::RegenerationStart(RegenerationStart {
            regeneration_id: self.regeneration_id,
        });
        for link in self.links.values_mut().filter(|l| !l.is_disconnected()) {
            if link.identity().is_none() {
                continue;
            }
            if let Err(e) = link.send(msg.clone()) {
                warn!("RegenerationStart to {} failed: {}", link.label(), e);
            }
        }

        self.coordinator.set_regeneration(self.regeneration_id);
        self.publish_world(payload)?;
        Ok(self.regeneration_id)
    }

    fn enter_map_transfer(&mut self) -> Result<()> {
        let snapshot = WorldSnapshot::capture(&self.payload, self.codec.as_ref())?;

        self.links.retain(|_, l| !l.is_disconnected());
        for link in self.links.values_mut() {
            link.clear_announced_phase();
        }
        self.barrier.reset();
        self.set_phase(HostPhase::MapTransfer);
        self.coordinator.begin(snapshot, &mut self.links, &self.config);
        Ok(())
    }

    fn set_phase(&mut self, next: HostPhase) -> Option<(HostPhase, HostPhase)> {
        if self.phase == next {
            return None;
        }
        let prev = std::mem::replace(&mut self.phase, next);
        info!("Host phase {} -> {}", prev, next);
        Some((prev, next))
    }

    // -----------------------------------------------------------------------
    // Main tick
    // -----------------------------------------------------------------------

    pub fn tick(&mut self, dt: Duration) -> HostTick {
        self.tick_count += 1;
        self.correlate_pending(dt);

        let mut out = HostTick {
            tick: self.tick_count,
            ..Default::default()
        };

        if self.phase == HostPhase::MapTransfer {
            let (status, stats) = self.coordinator.tick(dt, &mut self.links, &self.config);
            out.chunks_sent = stats.chunks_sent;
            self.chunks_sent += stats.chunks_sent as u64;
            self.bytes_sent += stats.bytes_sent as u64;
            if status != RoundStatus::Active {
                out.transitions
                    .extend(self.set_phase(HostPhase::WaitForClientsToBeReady));
            }
        }

        if self.phase == HostPhase::WaitForClientsToBeReady
            && self.barrier.poll(&self.links, dt) == BarrierStatus::Released
        {
            self.rounds_completed += 1;
            self.broadcast_transfer_complete();
            out.transitions.extend(self.set_phase(HostPhase::Playing));
        }

        out.phase = Some(self.phase);
        out
    }

    fn broadcast_transfer_complete(&mut self) {
        for link in self.links.values_mut().filter(|l| !l.is_disconnected()) {
            let Some(transfer_id) = link.transfer_id().map(str::to_string) else {
                continue;
            };
            if let Err(e) = link.send(HostMessage::TransferComplete(MapTransferComplete {
                transfer_id,
            })) {
                warn!("TransferComplete to {} failed: {}", link.label(), e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Bulk/control correlation
    // -----------------------------------------------------------------------

    fn find_identified(&self, client_unique_id: &str) -> Option<ConnectionId> {
        self.links
            .iter()
            .find(|(_, l)| !l.is_disconnected() && l.client_id() == Some(client_unique_id))
            .map(|(c, _)| *c)
    }

    fn bind_bulk(&mut self, conn: ConnectionId, bulk: Box<dyn BulkChannel>) {
        if let Some(link) = self.links.get_mut(&conn) {
            info!("Bulk channel bound to {}", link.label());
            link.attach_bulk(bulk);
        }
    }

    fn correlate_pending(&mut self, dt: Duration) {
        if self.pending_bulk.is_empty() {
            return;
        }
        let retry = self.config.identification_retry();
        let max_attempts = self.config.identification_max_attempts;

        let pending = std::mem::take(&mut self.pending_bulk);
        for mut p in pending {
            if let Some(conn) = self.find_identified(&p.identification.client_unique_id) {
                self.bind_bulk(conn, p.bulk);
                continue;
            }
            p.since_attempt += dt;
            if p.since_attempt >= retry {
                p.since_attempt = Duration::ZERO;
                p.attempts += 1;
            }
            if p.attempts >= max_attempts {
                warn!(
                    "Dropping bulk channel from {}: no matching control identity after {} attempts",
                    p.identification.client_unique_id, p.attempts
                );
                continue;
            }
            self.pending_bulk.push(p);
        }
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            phase: self.phase,
            connected_clients: self.links.values().filter(|l| !l.is_disconnected()).count(),
            active_workers: self.coordinator.active_workers(),
            chunks_sent: self.chunks_sent,
            bytes_sent: self.bytes_sent,
            rounds_completed: self.rounds_completed,
            regeneration_id: self.regeneration_id,
            total_ticks: self.tick_count,
        }
    }
}
