//! Channel seams between the sync state machines and the byte transport.
//!
//! The state machines never touch sockets; they talk to these traits. The
//! tokio runtime in `net` implements them over TCP, [`memory`] implements
//! them in-process for tests and local loopback.

use crate::error::Result;
use crate::protocol::{ClientIdentification, HostMessage, MapChunk, ReceiverMessage};

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// Host → receiver control channel. Reliable, ordered.
pub trait ControlChannel: Send {
    fn send(&mut self, msg: HostMessage) -> Result<()>;
    /// Tear the connection down. Later sends fail with `ChannelClosed`.
    fn close(&mut self);
}

/// Host → receiver bulk channel with an inspectable outgoing buffer.
pub trait BulkChannel: Send {
    fn is_connected(&self) -> bool;
    /// Bytes handed to the channel but not yet written out.
    fn buffered_bytes(&self) -> usize;
    fn send_chunk(&mut self, chunk: MapChunk) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Receiver side
// ---------------------------------------------------------------------------

/// Receiver → host control channel.
pub trait HostLink: Send {
    fn send(&mut self, msg: ReceiverMessage) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkStatus {
    Idle,
    Pending,
    Connected,
    Failed(String),
}

/// Opens the receiver's bulk channel on demand.
///
/// Connecting may take several ticks; the caller polls [`BulkConnector::status`].
pub trait BulkConnector: Send {
    fn begin_connect(&mut self, identification: ClientIdentification) -> Result<()>;
    fn status(&self) -> BulkStatus;
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Outbound queue shared between the sending half and whoever drains it.
    #[derive(Debug)]
    pub struct Queue<T> {
        inner: Arc<Mutex<QueueState<T>>>,
    }

    #[derive(Debug)]
    struct QueueState<T> {
        items: VecDeque<T>,
        closed: bool,
    }

    impl<T> Clone for Queue<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<T> Default for Queue<T> {
        fn default() -> Self {
            Self {
                inner: Arc::new(Mutex::new(QueueState {
                    items: VecDeque::new(),
                    closed: false,
                })),
            }
        }
    }

    impl<T> Queue<T> {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, item: T) -> Result<()> {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(SyncError::ChannelClosed);
            }
            state.items.push_back(item);
            Ok(())
        }

        pub fn drain(&self) -> Vec<T> {
            self.inner.lock().items.drain(..).collect()
        }

        pub fn pop(&self) -> Option<T> {
            self.inner.lock().items.pop_front()
        }

        pub fn len(&self) -> usize {
            self.inner.lock().items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn close(&self) {
            self.inner.lock().closed = true;
        }

        pub fn is_closed(&self) -> bool {
            self.inner.lock().closed
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MemoryControl {
        pub outbox: Queue<HostMessage>,
    }

    impl ControlChannel for MemoryControl {
        fn send(&mut self, msg: HostMessage) -> Result<()> {
            self.outbox.push(msg)
        }

        fn close(&mut self) {
            self.outbox.close();
        }
    }

    /// Bulk channel whose buffer occupancy is the payload bytes still queued.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryBulk {
        pub outbox: Queue<MapChunk>,
    }

    impl MemoryBulk {
        /// Simulate the transport flushing everything it holds.
        pub fn flush(&self) -> Vec<MapChunk> {
            self.outbox.drain()
        }
    }

    impl BulkChannel for MemoryBulk {
        fn is_connected(&self) -> bool {
            !self.outbox.is_closed()
        }

        fn buffered_bytes(&self) -> usize {
            self.outbox
                .inner
                .lock()
                .items
                .iter()
                .map(|c| c.payload.len())
                .sum()
        }

        fn send_chunk(&mut self, chunk: MapChunk) -> Result<()> {
            self.outbox.push(chunk)
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MemoryHostLink {
        pub outbox: Queue<ReceiverMessage>,
    }

    impl HostLink for MemoryHostLink {
        fn send(&mut self, msg: ReceiverMessage) -> Result<()> {
            self.outbox.push(msg)
        }
    }

    /// Bulk connector whose outcome is decided by the test (or loopback).
    #[derive(Debug, Clone)]
    pub struct MemoryConnector {
        state: Arc<Mutex<ConnectorState>>,
    }

    #[derive(Debug)]
    struct ConnectorState {
        status: BulkStatus,
        auto_connect: bool,
        requests: Vec<ClientIdentification>,
        closes: usize,
    }

    impl Default for MemoryConnector {
        fn default() -> Self {
            Self::auto()
        }
    }

    impl MemoryConnector {
        /// Connects as soon as it is asked to.
        pub fn auto() -> Self {
            Self::with_auto(true)
        }

        /// Stays Pending until [`MemoryConnector::complete`] or [`MemoryConnector::fail`].
        pub fn manual() -> Self {
            Self::with_auto(false)
        }

        fn with_auto(auto_connect: bool) -> Self {
            Self {
                state: Arc::new(Mutex::new(ConnectorState {
                    status: BulkStatus::Idle,
                    auto_connect,
                    requests: Vec::new(),
                    closes: 0,
                })),
            }
        }

        pub fn complete(&self) {
            self.state.lock().status = BulkStatus::Connected;
        }

        pub fn fail(&self, reason: &str) {
            self.state.lock().status = BulkStatus::Failed(reason.to_string());
        }

        pub fn requests(&self) -> Vec<ClientIdentification> {
            self.state.lock().requests.clone()
        }

        pub fn close_count(&self) -> usize {
            self.state.lock().closes
        }
    }

    impl BulkConnector for MemoryConnector {
        fn begin_connect(&mut self, identification: ClientIdentification) -> Result<()> {
            let mut state = self.state.lock();
            state.requests.push(identification);
            state.status = if state.auto_connect {
                BulkStatus::Connected
            } else {
                BulkStatus::Pending
            };
            Ok(())
        }

        fn status(&self) -> BulkStatus {
            self.state.lock().status.clone()
        }

        fn close(&mut self) {
            let mut state = self.state.lock();
            state.status = BulkStatus::Idle;
            state.closes += 1;
        }
    }
}
