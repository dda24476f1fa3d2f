//! Host runtime – TCP listeners, per-connection tasks and the tick loop.
//!
//! ## Tasks
//!
//! | Task             | Count            | Does                                          |
//! |------------------|------------------|-----------------------------------------------|
//! | control accept   | 1                | spawns a control task per connection          |
//! | bulk accept      | 1                | spawns a bulk task per connection             |
//! | control          | 1 per receiver   | reads `ReceiverMessage`, feeds `Host`         |
//! | bulk             | 1 per receiver   | watches the bulk socket for close             |
//! | writer           | 2 per receiver   | drains queued frames to the socket            |
//! | tick             | 1                | `Host::tick` at `tick_rate_hz`, regeneration  |
//!
//! Every task touches the host only through the shared `parking_lot::Mutex`
//! and never holds it across an `.await`.

use super::codec::{self, Frame};
use crate::error::{Result as SyncResult, SyncError};
use crate::host::{ConnectionId, SharedHost};
use crate::protocol::{ClientIdentification, HostMessage, MapChunk, ReceiverMessage};
use crate::transport::{BulkChannel, ControlChannel};
use crate::world::{DungeonWorld, WorldPayload};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::Instrument;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HostServerConfig {
    pub control_addr: String,
    pub bulk_addr: String,
    /// Regenerate the dungeon on this period while playing.
    pub regenerate_every: Option<Duration>,
    pub world_size: (u32, u32, u32),
    pub seed: u64,
    pub stats_interval: Duration,
}

impl Default for HostServerConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:7400".into(),
            bulk_addr: "0.0.0.0:7401".into(),
            regenerate_every: None,
            world_size: (64, 16, 64),
            seed: 42,
            stats_interval: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel implementations
// ---------------------------------------------------------------------------

/// Control channel backed by a writer task. Closing drops the sender; the
/// writer drains what is queued and then shuts the socket's write half.
struct TcpControl {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ControlChannel for TcpControl {
    fn send(&mut self, msg: HostMessage) -> SyncResult<()> {
        let tx = self.tx.as_ref().ok_or(SyncError::ChannelClosed)?;
        let mut buf = BytesMut::new();
        codec::encode_message(&msg, &mut buf)?;
        tx.send(buf.freeze()).map_err(|_| SyncError::ChannelClosed)
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Bulk channel whose occupancy is the bytes queued to its writer task.
struct TcpBulk {
    tx: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
}

impl BulkChannel for TcpBulk {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn send_chunk(&mut self, chunk: MapChunk) -> SyncResult<()> {
        let mut buf = BytesMut::new();
        codec::encode_chunk(&chunk, &mut buf)?;
        let frame = buf.freeze();
        self.buffered.fetch_add(frame.len(), Ordering::AcqRel);
        let len = frame.len();
        self.tx.send(frame).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            SyncError::ChannelClosed
        })
    }
}

/// Drain `rx` into `writer`. `buffered` is decremented as bytes hit the
/// socket; `connected` drops on the first write error.
fn spawn_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    buffered: Option<Arc<AtomicUsize>>,
    connected: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            while let Some(frame) = rx.recv().await {
                let len = frame.len();
                let result = codec::write_buf(&mut writer, &frame).await;
                if let Some(b) = &buffered {
                    b.fetch_sub(len, Ordering::AcqRel);
                }
                if let Err(e) = result {
                    debug!("Writer stopped: {}", e);
                    break;
                }
            }
            connected.store(false, Ordering::Release);
        }
        .in_current_span(),
    );
}

// ---------------------------------------------------------------------------
// HostServer
// ---------------------------------------------------------------------------

pub struct HostServer {
    config: HostServerConfig,
    host: SharedHost,
}

impl HostServer {
    pub fn new(config: HostServerConfig, host: SharedHost) -> Self {
        Self { config, host }
    }

    /// Bind both listeners and run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let control = TcpListener::bind(&self.config.control_addr)
            .await
            .with_context(|| format!("Failed to bind control port {}", self.config.control_addr))?;
        let bulk = TcpListener::bind(&self.config.bulk_addr)
            .await
            .with_context(|| format!("Failed to bind bulk port {}", self.config.bulk_addr))?;
        info!(
            "Host listening: control {} / bulk {}",
            self.config.control_addr, self.config.bulk_addr
        );

        let control_handle = tokio::spawn(accept_control(control, self.host.clone()));
        let bulk_handle = tokio::spawn(accept_bulk(bulk, self.host.clone()));
        let tick_handle = tokio::spawn(tick_loop(self.config.clone(), self.host.clone()));

        tokio::select! {
            r = control_handle => log::error!("Control listener exited: {:?}", r),
            r = bulk_handle => log::error!("Bulk listener exited: {:?}", r),
            _ = tick_handle => log::error!("Host tick loop exited unexpectedly"),
            _ = tokio::signal::ctrl_c() => info!("Host shutting down (SIGINT)"),
        }

        let stats = self.host.lock().stats();
        info!(
            "Final stats: {} rounds, {} chunks / {} bytes sent, {} ticks",
            stats.rounds_completed, stats.chunks_sent, stats.bytes_sent, stats.total_ticks
        );
        Ok(())
    }
}

async fn tick_loop(config: HostServerConfig, host: SharedHost) {
    let interval = host.lock().config().tick_interval();
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last = Instant::now();
    let mut since_regen = Duration::ZERO;
    let mut since_stats = Duration::ZERO;
    loop {
        timer.tick().await;
        let now = Instant::now();
        let dt = now - last;
        last = now;

        let mut h = host.lock();
        let tick = h.tick(dt);
        for (from, to) in &tick.transitions {
            debug!("tick {}: {} -> {}", tick.tick, from, to);
        }

        since_stats += dt;
        if since_stats >= config.stats_interval {
            since_stats = Duration::ZERO;
            info!("{:?}", h.stats());
        }

        let Some(every) = config.regenerate_every else {
            continue;
        };
        if h.phase() != crate::types::HostPhase::Playing {
            since_regen = Duration::ZERO;
            continue;
        }
        since_regen += dt;
        if since_regen >= every {
            since_regen = Duration::ZERO;
            let seed = config.seed.wrapping_add(h.regeneration_id() as u64 + 1);
            let payload = WorldPayload::new(DungeonWorld::generate(seed, config.world_size));
            if let Err(e) = h.regenerate(payload) {
                warn!("Regeneration failed: {}", e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control connections
// ---------------------------------------------------------------------------

async fn accept_control(listener: TcpListener, host: SharedHost) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("control accept")?;
        let host = host.clone();
        let span = tracing::info_span!("control", %peer, client = tracing::field::Empty);
        tokio::spawn(
            async move {
                if let Err(e) = serve_control(stream, peer, host).await {
                    warn!("Control connection ended: {:#}", e);
                }
            }
            .instrument(span),
        );
    }
}

async fn serve_control(stream: TcpStream, peer: SocketAddr, host: SharedHost) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let mut buf = BytesMut::new();

    let identity = match codec::read_frame::<_, ReceiverMessage>(&mut reader, &mut buf).await? {
        Some(Frame::Message(ReceiverMessage::Identification(ident))) => ident,
        Some(_) => anyhow::bail!("first control frame from {} was not an identification", peer),
        None => return Ok(()),
    };
    tracing::Span::current().record("client", identity.client_unique_id.as_str());

    let (tx, rx) = mpsc::unbounded_channel();
    spawn_writer(writer, rx, None, Arc::new(AtomicBool::new(true)));

    let conn = {
        let mut h = host.lock();
        let conn = h.connect(Box::new(TcpControl { tx: Some(tx) }));
        h.identify_control(conn, identity.clone())?;
        conn
    };
    info!("{} ({}) on control channel as {}", identity.client_unique_id, peer, conn);

    let result = read_control(&mut reader, &mut buf, conn, &host).await;
    host.lock().disconnect(conn);
    result
}

async fn read_control(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    conn: ConnectionId,
    host: &SharedHost,
) -> Result<()> {
    loop {
        match codec::read_frame::<_, ReceiverMessage>(reader, buf).await? {
            Some(Frame::Message(msg)) => match host.lock().handle_message(conn, msg) {
                Ok(()) => {}
                Err(SyncError::UnknownClient(_)) => {
                    info!("{} dropped by host", conn);
                    return Ok(());
                }
                Err(e) => warn!("{}: {}", conn, e),
            },
            Some(Frame::Chunk(_)) => {
                anyhow::bail!("{} sent a chunk on the control channel", conn);
            }
            None => {
                info!("{} closed control channel", conn);
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bulk connections
// ---------------------------------------------------------------------------

async fn accept_bulk(listener: TcpListener, host: SharedHost) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("bulk accept")?;
        let host = host.clone();
        let span = tracing::info_span!("bulk", %peer, client = tracing::field::Empty);
        tokio::spawn(
            async move {
                if let Err(e) = serve_bulk(stream, peer, host).await {
                    warn!("Bulk connection ended: {:#}", e);
                }
            }
            .instrument(span),
        );
    }
}

async fn serve_bulk(stream: TcpStream, peer: SocketAddr, host: SharedHost) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let mut buf = BytesMut::new();

    let identity: ClientIdentification =
        match codec::read_frame::<_, ClientIdentification>(&mut reader, &mut buf).await? {
            Some(Frame::Message(ident)) => ident,
            Some(Frame::Chunk(_)) => anyhow::bail!("bulk connection from {} sent a chunk", peer),
            None => return Ok(()),
        };
    tracing::Span::current().record("client", identity.client_unique_id.as_str());
    info!("{} ({}) opened bulk channel", identity.client_unique_id, peer);

    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let connected = Arc::new(AtomicBool::new(true));
    spawn_writer(writer, rx, Some(buffered.clone()), connected.clone());

    host.lock().identify_bulk(
        identity.clone(),
        Box::new(TcpBulk {
            tx,
            buffered,
            connected: connected.clone(),
        }),
    );

    // Nothing else is expected from the receiver; wait for the close.
    let result = loop {
        match codec::read_frame::<_, ClientIdentification>(&mut reader, &mut buf).await {
            Ok(Some(_)) => debug!("Ignoring extra frame on bulk channel"),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    connected.store(false, Ordering::Release);
    host.lock().bulk_lost(&identity.client_unique_id);
    result.map_err(anyhow::Error::from)
}
