//! Host-global transfer coordinator: one snapshot per round, one worker per
//! receiver, periodic progress broadcast.

use crate::error::SyncError;
use crate::host::link::{ClientLink, ConnectionId};
use crate::host::worker::{TransferWorker, WorkerTick};
use crate::protocol::{AllClientProgress, HostMessage};
use crate::types::SyncConfig;
use crate::world::WorldSnapshot;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::time::Duration;

/// Result of a worker that has retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedTransfer {
    pub total_chunks: u32,
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    /// No round in progress.
    Idle,
    Active,
    /// The last worker retired this tick; snapshot released.
    Finished,
}

/// Aggregate of one coordinator tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorTick {
    pub chunks_sent: usize,
    pub bytes_sent: usize,
    pub broadcast: bool,
}

#[derive(Default)]
pub struct TransferCoordinator {
    snapshot: Option<WorldSnapshot>,
    round: u64,
    workers: BTreeMap<ConnectionId, TransferWorker>,
    finished: BTreeMap<ConnectionId, FinishedTransfer>,
    since_broadcast: Duration,
    regeneration_id: i64,
}

impl TransferCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_active(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, conn: ConnectionId) -> Option<&TransferWorker> {
        self.workers.get(&conn)
    }

    pub fn finished(&self, conn: ConnectionId) -> Option<FinishedTransfer> {
        self.finished.get(&conn).copied()
    }

    /// Regeneration that workers spawned from now on belong to.
    pub fn set_regeneration(&mut self, regeneration_id: i64) {
        self.regeneration_id = regeneration_id;
    }

    /// Start a round: take ownership of the snapshot and spawn a worker for
    /// every connected receiver.
    pub fn begin(
        &mut self,
        snapshot: WorldSnapshot,
        links: &mut BTreeMap<ConnectionId, ClientLink>,
        config: &SyncConfig,
    ) {
        self.round += 1;
        self.workers.clear();
        self.finished.clear();
        self.since_broadcast = Duration::ZERO;
        info!(
            "Transfer round {} for world {} ({} bytes) to {} receiver(s)",
            self.round,
            snapshot.world_id,
            snapshot.len(),
            links.values().filter(|l| !l.is_disconnected()).count()
        );
        self.snapshot = Some(snapshot);

        let conns: Vec<_> = links
            .iter()
            .filter(|(_, l)| !l.is_disconnected())
            .map(|(c, _)| *c)
            .collect();
        for conn in conns {
            if let Some(link) = links.get_mut(&conn) {
                self.spawn(link, config);
            }
        }
    }

    /// Add a worker for a receiver that connected mid-round.
    pub fn spawn(&mut self, link: &mut ClientLink, config: &SyncConfig) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let conn = link.conn();
        if self.workers.contains_key(&conn) || self.finished.contains_key(&conn) {
            return;
        }
        let transfer_id = format!("{}-r{}-{}", snapshot.world_id, self.round, conn.0);
        let mut worker = TransferWorker::new(transfer_id, snapshot.clone(), config.chunk_size)
            .with_regeneration(self.regeneration_id);
        if let Err(e) = worker.start(link) {
            warn!("Failed to start transfer for {}: {}", link.label(), e);
        }
        self.workers.insert(conn, worker);
    }

    /// Drop a receiver's worker without reporting any more progress for it.
    pub fn retire(&mut self, conn: ConnectionId) {
        if let Some(worker) = self.workers.remove(&conn) {
            debug!(
                "Retired transfer {} after {}/{} chunks",
                worker.transfer_id(),
                worker.chunks_sent(),
                worker.total_chunks()
            );
        }
        self.finished.remove(&conn);
    }

    pub fn tick(
        &mut self,
        dt: Duration,
        links: &mut BTreeMap<ConnectionId, ClientLink>,
        config: &SyncConfig,
    ) -> (RoundStatus, CoordinatorTick) {
        let mut out = CoordinatorTick::default();
        if self.snapshot.is_none() {
            return (RoundStatus::Idle, out);
        }

        let mut retired = Vec::new();
        for (conn, worker) in self.workers.iter_mut() {
            let Some(link) = links.get_mut(conn).filter(|l| !l.is_disconnected()) else {
                retired.push((*conn, None));
                continue;
            };
            match worker.update(link, config) {
                Ok(WorkerTick {
                    chunks_sent,
                    bytes_sent,
                    ..
                }) => {
                    out.chunks_sent += chunks_sent;
                    out.bytes_sent += bytes_sent;
                }
                Err(SyncError::ChannelClosed) => {
                    warn!("{} channel closed mid-transfer", link.label());
                    link.mark_disconnected();
                    retired.push((*conn, None));
                    continue;
                }
                Err(e) => {
                    warn!("Transfer {} aborted: {}", worker.transfer_id(), e);
                    retired.push((*conn, None));
                    continue;
                }
            }
            if worker.is_complete() {
                retired.push((
                    *conn,
                    Some(FinishedTransfer {
                        total_chunks: worker.total_chunks(),
                        skipped: worker.skipped(),
                    }),
                ));
            }
        }
        for (conn, finished) in retired {
            self.workers.remove(&conn);
            if let Some(f) = finished {
                self.finished.insert(conn, f);
            }
        }

        self.since_broadcast += dt;
        let round_over = self.workers.is_empty();
        if round_over || self.since_broadcast >= config.progress_interval() {
            self.broadcast_progress(links);
            self.since_broadcast = Duration::ZERO;
            out.broadcast = true;
        }

        if round_over {
            info!(
                "Transfer round {} finished ({} sent, {} skipped)",
                self.round,
                self.finished.values().filter(|f| !f.skipped).count(),
                self.finished.values().filter(|f| f.skipped).count()
            );
            self.snapshot = None;
            return (RoundStatus::Finished, out);
        }
        (RoundStatus::Active, out)
    }

    /// Progress map as seen by `viewer`: every identified receiver except
    /// the viewer itself.
    pub fn progress_for(
        &self,
        links: &BTreeMap<ConnectionId, ClientLink>,
        viewer: ConnectionId,
    ) -> AllClientProgress {
        let mut progress = BTreeMap::new();
        for (conn, link) in links {
            if *conn == viewer || link.is_disconnected() {
                continue;
            }
            let Some(client_id) = link.client_id() else {
                continue;
            };
            let value = if let Some(worker) = self.workers.get(conn) {
                worker.chunks_sent() as i32
            } else if let Some(f) = self.finished.get(conn) {
                f.total_chunks as i32
            } else {
                continue;
            };
            progress.insert(client_id.to_string(), value);
        }
        AllClientProgress { progress }
    }

    fn broadcast_progress(&self, links: &mut BTreeMap<ConnectionId, ClientLink>) {
        let viewers: Vec<_> = links
            .iter()
            .filter(|(_, l)| !l.is_disconnected() && l.identity().is_some())
            .map(|(c, _)| *c)
            .collect();
        for viewer in viewers {
            let msg = HostMessage::Progress(self.progress_for(links, viewer));
            if let Some(link) = links.get_mut(&viewer) {
                if let Err(e) = link.send(msg) {
                    debug!("Progress broadcast to {} failed: {}", link.label(), e);
                }
            }
        }
    }
}
