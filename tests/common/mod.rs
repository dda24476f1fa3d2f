//! In-process loopback between a `Host` and any number of receivers.
//!
//! Each `pump` moves one tick of traffic in both directions over the
//! memory transport, in the order a real runtime would observe it.

#![allow(dead_code)]

use dungeon_sync::error::Result;
use dungeon_sync::host::ConnectionId;
use dungeon_sync::protocol::{ClientIdentification, ReceiverMessage};
use dungeon_sync::receiver::{AssetBuilder, Dispatcher, InlineDispatcher, NullBuilder};
use dungeon_sync::transport::memory::{MemoryBulk, MemoryConnector, MemoryControl, MemoryHostLink};
use dungeon_sync::transport::{BulkConnector, BulkStatus};
use dungeon_sync::world::{DungeonWorld, JsonWorldCodec, WorldCodec, WorldPayload};
use dungeon_sync::{Host, ReceiverContext, ReceiverEvent, ReceiverSession, SyncConfig, WorldId};
use std::sync::Arc;
use std::time::Duration;

pub const TICK: Duration = Duration::from_millis(33);

pub fn identity(id: &str) -> ClientIdentification {
    ClientIdentification {
        client_unique_id: id.to_string(),
        client_name: format!("player {}", id),
    }
}

pub fn small_world(seed: u64) -> WorldPayload {
    WorldPayload::new(DungeonWorld::generate(seed, (16, 8, 16)))
}

// ---------------------------------------------------------------------------
// Codec with a fixed encoded size
// ---------------------------------------------------------------------------

/// JSON codec that pads every encoding with trailing whitespace to exactly
/// `len` bytes, so tests control the chunk count.
pub struct PaddedCodec {
    pub len: usize,
}

impl WorldCodec for PaddedCodec {
    fn encode(&self, payload: &WorldPayload) -> Result<Vec<u8>> {
        let mut bytes = JsonWorldCodec.encode(payload)?;
        assert!(bytes.len() <= self.len, "world too large for padding");
        bytes.resize(self.len, b' ');
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<WorldPayload> {
        JsonWorldCodec.decode(bytes)
    }

    fn world_id(&self, world: &DungeonWorld) -> Result<WorldId> {
        JsonWorldCodec.world_id(world)
    }
}

/// Decoder that rejects everything, for the corrupt-data path.
pub struct RejectingCodec;

impl WorldCodec for RejectingCodec {
    fn encode(&self, payload: &WorldPayload) -> Result<Vec<u8>> {
        JsonWorldCodec.encode(payload)
    }

    fn decode(&self, _bytes: &[u8]) -> Result<WorldPayload> {
        Ok(serde_json::from_slice::<WorldPayload>(b"{not json")?)
    }

    fn world_id(&self, world: &DungeonWorld) -> Result<WorldId> {
        JsonWorldCodec.world_id(world)
    }
}

// ---------------------------------------------------------------------------
// Standalone receiver context
// ---------------------------------------------------------------------------

/// Memory doubles behind a `ReceiverContext`, kept for inspection.
pub struct Doubles {
    pub link: MemoryHostLink,
    pub connector: MemoryConnector,
}

impl Doubles {
    /// Phase names announced so far, as `(old, new)`.
    pub fn announcements(&self) -> Vec<(String, String)> {
        self.link
            .outbox
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ReceiverMessage::StateChange(c) => Some((c.old_phase, c.new_phase)),
                _ => None,
            })
            .collect()
    }
}

pub fn context(
    id: &str,
    connector: MemoryConnector,
    builder: Arc<dyn AssetBuilder>,
    dispatcher: Arc<dyn Dispatcher>,
    codec: Arc<dyn WorldCodec>,
) -> (ReceiverContext, Doubles) {
    let link = MemoryHostLink::default();
    let ctx = ReceiverContext {
        identity: identity(id),
        link: Box::new(link.clone()),
        connector: Box::new(connector.clone()),
        builder,
        dispatcher,
        codec,
    };
    (ctx, Doubles { link, connector })
}

pub fn default_context(id: &str) -> (ReceiverContext, Doubles) {
    context(
        id,
        MemoryConnector::auto(),
        Arc::new(NullBuilder),
        Arc::new(InlineDispatcher),
        Arc::new(JsonWorldCodec),
    )
}

// ---------------------------------------------------------------------------
// Loopback receiver
// ---------------------------------------------------------------------------

pub struct LoopbackReceiver {
    pub conn: ConnectionId,
    pub session: ReceiverSession,
    /// Host → receiver control traffic.
    pub control: MemoryControl,
    /// Receiver → host control traffic.
    pub link: MemoryHostLink,
    pub connector: MemoryConnector,
    pub bulk: Option<MemoryBulk>,
    attached_requests: usize,
    pub chunks_delivered: usize,
    pub events: Vec<ReceiverEvent>,
    /// When set, chunks pile up on the host side instead of being delivered.
    pub hold_chunks: bool,
    pub reconnects: usize,
}

impl LoopbackReceiver {
    pub fn join(host: &mut Host, id: &str, config: SyncConfig) -> Self {
        Self::join_with(host, id, config, Arc::new(NullBuilder), Arc::new(JsonWorldCodec))
    }

    pub fn join_with(
        host: &mut Host,
        id: &str,
        config: SyncConfig,
        builder: Arc<dyn AssetBuilder>,
        codec: Arc<dyn WorldCodec>,
    ) -> Self {
        let control = MemoryControl::default();
        let conn = host.connect(Box::new(control.clone()));
        let (ctx, doubles) = context(
            id,
            MemoryConnector::auto(),
            builder,
            Arc::new(InlineDispatcher),
            codec,
        );
        let mut session = ReceiverSession::new(config, ctx);
        session.identify().unwrap();
        Self {
            conn,
            session,
            control,
            link: doubles.link,
            connector: doubles.connector,
            bulk: None,
            attached_requests: 0,
            chunks_delivered: 0,
            events: Vec::new(),
            hold_chunks: false,
            reconnects: 0,
        }
    }

    /// The host dropped this receiver: open a new control channel and let
    /// the session identify again over it.
    pub fn reconnect(&mut self, host: &mut Host) {
        if let Some(bulk) = self.bulk.take() {
            bulk.outbox.close();
        }
        self.control = MemoryControl::default();
        self.conn = host.connect(Box::new(self.control.clone()));
        self.session.reconnect(Box::new(self.link.clone())).unwrap();
        self.attached_requests = self.connector.requests().len();
        self.reconnects += 1;
    }

    pub fn id(&self) -> String {
        self.session.context().identity.client_unique_id.clone()
    }

    pub fn phase(&self) -> &'static str {
        self.session.announced_phase()
    }

    pub fn has_event(&self, pred: impl Fn(&ReceiverEvent) -> bool) -> bool {
        self.events.iter().any(pred)
    }
}

/// One tick of traffic in both directions, then one tick on every side.
pub fn pump(host: &mut Host, receivers: &mut [LoopbackReceiver], dt: Duration) {
    for r in receivers.iter_mut() {
        for msg in r.link.outbox.drain() {
            let _ = host.handle_message(r.conn, msg);
        }
    }

    for r in receivers.iter_mut() {
        let requests = r.connector.requests().len();
        let status = r.connector.status();
        if requests > r.attached_requests && status == BulkStatus::Connected {
            r.attached_requests = requests;
            let bulk = MemoryBulk::default();
            host.identify_bulk(r.session.context().identity.clone(), Box::new(bulk.clone()));
            r.bulk = Some(bulk);
        } else if matches!(status, BulkStatus::Idle | BulkStatus::Failed(_)) {
            if let Some(bulk) = r.bulk.take() {
                bulk.outbox.close();
                host.bulk_lost(&r.id());
            }
        }
    }

    host.tick(dt);

    for r in receivers.iter_mut() {
        for msg in r.control.outbox.drain() {
            let _ = r.session.handle(msg);
        }
        if r.control.outbox.is_closed() {
            r.reconnect(host);
        }
        if !r.hold_chunks {
            if let Some(bulk) = r.bulk.clone() {
                for chunk in bulk.flush() {
                    r.chunks_delivered += 1;
                    let _ = r.session.handle_chunk(&chunk);
                }
            }
        }
        let events = r.session.tick(dt);
        r.events.extend(events);
    }
}

/// Pump until `done` holds. Returns the number of ticks taken.
pub fn run_until(
    host: &mut Host,
    receivers: &mut [LoopbackReceiver],
    max_ticks: usize,
    done: impl Fn(&Host, &[LoopbackReceiver]) -> bool,
) -> usize {
    for tick in 1..=max_ticks {
        pump(host, receivers, TICK);
        if done(host, receivers) {
            return tick;
        }
    }
    panic!(
        "condition not reached in {} ticks (host {:?}, receivers {:?})",
        max_ticks,
        host.phase(),
        receivers.iter().map(|r| r.phase()).collect::<Vec<_>>()
    );
}

/// Host playing and every receiver Complete with a released host.
pub fn settled(host: &Host, receivers: &[LoopbackReceiver]) -> bool {
    host.phase() == dungeon_sync::HostPhase::Playing
        && receivers
            .iter()
            .all(|r| r.session.machine().host_released() && !r.session.regeneration().is_active())
}
