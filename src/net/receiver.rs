//! Receiver runtime – control connection, on-demand bulk connection and the
//! tick loop that drives a [`ReceiverSession`].
//!
//! ```text
//! control reader task ──HostMessage──┐
//!                                    ├─► run loop ─► session.lock().handle*/tick
//! bulk task (per connect) ──MapChunk─┘        └────► MainThreadQueue::run_pending
//! ```

use super::codec::{self, Frame};
use crate::error::{Result as SyncResult, SyncError};
use crate::protocol::{ClientIdentification, HostMessage, MapChunk, ReceiverMessage};
use crate::receiver::{
    AssetBuilder, MainThreadQueue, ReceiverContext, ReceiverEvent, ReceiverSession,
};
use crate::transport::{BulkConnector, BulkStatus, HostLink};
use crate::types::SyncConfig;
use crate::world::JsonWorldCodec;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

pub type SharedSession = Arc<Mutex<ReceiverSession>>;

#[derive(Debug, Clone)]
pub struct ReceiverClientConfig {
    pub control_addr: String,
    pub bulk_addr: String,
    pub client_unique_id: String,
    pub client_name: String,
}

// ---------------------------------------------------------------------------
// Channel implementations
// ---------------------------------------------------------------------------

struct TcpHostLink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl HostLink for TcpHostLink {
    fn send(&mut self, msg: ReceiverMessage) -> SyncResult<()> {
        let mut buf = BytesMut::new();
        codec::encode_message(&msg, &mut buf)?;
        self.tx
            .send(buf.freeze())
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// Opens the bulk connection on a runtime task and forwards its chunks to
/// the run loop.
pub struct TokioBulkConnector {
    addr: String,
    runtime: Handle,
    status: Arc<Mutex<BulkStatus>>,
    chunks: mpsc::UnboundedSender<MapChunk>,
    task: Option<JoinHandle<()>>,
}

impl TokioBulkConnector {
    pub fn new(addr: String, runtime: Handle, chunks: mpsc::UnboundedSender<MapChunk>) -> Self {
        Self {
            addr,
            runtime,
            status: Arc::new(Mutex::new(BulkStatus::Idle)),
            chunks,
            task: None,
        }
    }
}

impl BulkConnector for TokioBulkConnector {
    fn begin_connect(&mut self, identification: ClientIdentification) -> SyncResult<()> {
        self.close();
        *self.status.lock() = BulkStatus::Pending;

        let addr = self.addr.clone();
        let status = self.status.clone();
        let chunks = self.chunks.clone();
        let span = tracing::info_span!("bulk", client = %identification.client_unique_id);
        self.task = Some(self.runtime.spawn(
            async move {
                match bulk_session(&addr, identification, &status, chunks).await {
                    Ok(()) => {
                        debug!("Bulk channel closed by host");
                        *status.lock() = BulkStatus::Idle;
                    }
                    Err(e) => {
                        warn!("Bulk channel failed: {}", e);
                        *status.lock() = BulkStatus::Failed(e.to_string());
                    }
                }
            }
            .instrument(span),
        ));
        Ok(())
    }

    fn status(&self) -> BulkStatus {
        self.status.lock().clone()
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        *self.status.lock() = BulkStatus::Idle;
    }
}

async fn bulk_session(
    addr: &str,
    identification: ClientIdentification,
    status: &Mutex<BulkStatus>,
    chunks: mpsc::UnboundedSender<MapChunk>,
) -> SyncResult<()> {
    let mut stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);

    let mut buf = BytesMut::new();
    codec::encode_message(&identification, &mut buf)?;
    codec::write_buf(&mut stream, &buf).await?;
    *status.lock() = BulkStatus::Connected;
    info!("Bulk channel connected to {}", addr);

    let mut buf = BytesMut::new();
    loop {
        match codec::read_frame::<_, ClientIdentification>(&mut stream, &mut buf).await? {
            Some(Frame::Chunk(chunk)) => {
                if chunks.send(chunk).is_err() {
                    return Ok(());
                }
            }
            Some(Frame::Message(_)) => debug!("Ignoring message frame on bulk channel"),
            None => return Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// ReceiverClient
// ---------------------------------------------------------------------------

pub struct ReceiverClient {
    config: ReceiverClientConfig,
    sync: SyncConfig,
    builder: Arc<dyn AssetBuilder>,
}

impl ReceiverClient {
    pub fn new(config: ReceiverClientConfig, sync: SyncConfig, builder: Arc<dyn AssetBuilder>) -> Self {
        Self {
            config,
            sync,
            builder,
        }
    }

    /// Connect, identify and run until Ctrl-C. A dropped control connection
    /// is re-established every `retry_interval`; the session restarts its
    /// join once the host sends the next begin.
    pub async fn run(self) -> Result<()> {
        let (link, mut msg_rx) = open_control(&self.config.control_addr)
            .await
            .with_context(|| format!("Failed to connect to host {}", self.config.control_addr))?;
        info!(
            "Connected to host {} as '{}'",
            self.config.control_addr, self.config.client_unique_id
        );

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<MapChunk>();
        let queue = Arc::new(MainThreadQueue::new());
        let identity = ClientIdentification {
            client_unique_id: self.config.client_unique_id.clone(),
            client_name: self.config.client_name.clone(),
        };
        let ctx = ReceiverContext {
            identity,
            link: Box::new(link),
            connector: Box::new(TokioBulkConnector::new(
                self.config.bulk_addr.clone(),
                Handle::current(),
                chunk_tx,
            )),
            builder: self.builder.clone(),
            dispatcher: queue.clone(),
            codec: Arc::new(JsonWorldCodec),
        };
        let session: SharedSession = Arc::new(Mutex::new(ReceiverSession::new(self.sync.clone(), ctx)));
        session.lock().identify().context("Failed to send identification")?;

        let mut timer = tokio::time::interval(self.sync.tick_interval());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    // Chunks queued before the bulk task recorded a close
                    // must land before the session looks at the status.
                    while let Ok(chunk) = chunk_rx.try_recv() {
                        if let Err(e) = session.lock().handle_chunk(&chunk) {
                            warn!("{}", e);
                        }
                    }
                    let now = Instant::now();
                    let events = session.lock().tick(now - last);
                    last = now;
                    // Stand-in for the render thread draining its job queue.
                    queue.run_pending();
                    for event in events {
                        log_event(&event);
                    }
                }
                msg = msg_rx.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = session.lock().handle(msg) {
                            warn!("{}", e);
                        }
                    }
                    None => {
                        warn!("Host closed the control channel");
                        let Some((link, rx)) = self.reconnect().await else {
                            break;
                        };
                        msg_rx = rx;
                        if let Err(e) = session.lock().reconnect(Box::new(link)) {
                            warn!("Failed to identify after reconnect: {}", e);
                        }
                    }
                },
                Some(chunk) = chunk_rx.recv() => {
                    if let Err(e) = session.lock().handle_chunk(&chunk) {
                        warn!("{}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Receiver shutting down (SIGINT)");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Retry the control connection until it succeeds. `None` on Ctrl-C.
    async fn reconnect(&self) -> Option<(TcpHostLink, mpsc::UnboundedReceiver<HostMessage>)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            tokio::select! {
                _ = tokio::time::sleep(self.sync.retry_interval()) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Receiver shutting down (SIGINT)");
                    return None;
                }
            }
            match open_control(&self.config.control_addr).await {
                Ok(opened) => {
                    info!(
                        "Reconnected to host {} (attempt {})",
                        self.config.control_addr, attempt
                    );
                    return Some(opened);
                }
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}

/// Connect the control channel and spawn its writer and reader tasks.
async fn open_control(addr: &str) -> Result<(TcpHostLink, mpsc::UnboundedReceiver<HostMessage>)> {
    let stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = codec::write_buf(&mut writer, &frame).await {
                warn!("Control write failed: {}", e);
                break;
            }
        }
    });

    let (msg_tx, msg_rx) = mpsc::unbounded_channel::<HostMessage>();
    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        loop {
            match codec::read_frame::<_, HostMessage>(&mut reader, &mut buf).await {
                Ok(Some(Frame::Message(msg))) => {
                    if msg_tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(Some(Frame::Chunk(_))) => warn!("Chunk on control channel; dropped"),
                Ok(None) => break,
                Err(e) => {
                    warn!("Control read failed: {}", e);
                    break;
                }
            }
        }
    });

    Ok((TcpHostLink { tx: out_tx }, msg_rx))
}

fn log_event(event: &ReceiverEvent) {
    match event {
        ReceiverEvent::Phase { from, to } => debug!("phase {} -> {}", from, to),
        ReceiverEvent::Progress { received, total } => {
            debug!("downloaded {}/{} chunks", received, total)
        }
        ReceiverEvent::PeerProgress(map) => debug!("peers: {:?}", map),
        ReceiverEvent::WorldReady { world_id, skipped } => {
            info!("World {} ready (skipped download: {})", world_id, skipped)
        }
        ReceiverEvent::HostReleased { transfer_id } => {
            info!("Host released gameplay after {}", transfer_id)
        }
        ReceiverEvent::Failed { reason } => error!("Sync failed: {}", reason),
        ReceiverEvent::Stalled => error!("Host stalled; waiting for operator"),
    }
}
