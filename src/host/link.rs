//! Host-side record of one connected receiver and its two channels.

use crate::error::Result;
use crate::protocol::{phases, ClientIdentification, HostMessage, MapChunk};
use crate::transport::{BulkChannel, ControlChannel};

/// Transport-assigned key for a control connection, known before the
/// receiver has identified itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

pub struct ClientLink {
    conn: ConnectionId,
    identity: Option<ClientIdentification>,
    control: Box<dyn ControlChannel>,
    bulk: Option<Box<dyn BulkChannel>>,
    announced_phase: Option<String>,
    announced_transfer: Option<String>,
    ready_for_map: Option<i64>,
    transfer_id: Option<String>,
    disconnected: bool,
}

impl ClientLink {
    pub fn new(conn: ConnectionId, control: Box<dyn ControlChannel>) -> Self {
        Self {
            conn,
            identity: None,
            control,
            bulk: None,
            announced_phase: None,
            announced_transfer: None,
            ready_for_map: None,
            transfer_id: None,
            disconnected: false,
        }
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    pub fn identity(&self) -> Option<&ClientIdentification> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: ClientIdentification) {
        self.identity = Some(identity);
    }

    pub fn client_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.client_unique_id.as_str())
    }

    /// Client id for logs; falls back to the connection key.
    pub fn label(&self) -> String {
        match &self.identity {
            Some(i) => i.client_unique_id.clone(),
            None => self.conn.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    pub fn send(&mut self, msg: HostMessage) -> Result<()> {
        self.control.send(msg)
    }

    pub fn attach_bulk(&mut self, bulk: Box<dyn BulkChannel>) {
        self.bulk = Some(bulk);
    }

    pub fn detach_bulk(&mut self) {
        self.bulk = None;
    }

    pub fn bulk_connected(&self) -> bool {
        self.bulk.as_ref().is_some_and(|b| b.is_connected())
    }

    pub fn bulk_buffered_bytes(&self) -> usize {
        self.bulk.as_ref().map_or(0, |b| b.buffered_bytes())
    }

    pub fn send_chunk(&mut self, chunk: MapChunk) -> Result<()> {
        match self.bulk.as_mut() {
            Some(bulk) => bulk.send_chunk(chunk),
            None => Err(crate::error::SyncError::ChannelClosed),
        }
    }

    // -----------------------------------------------------------------------
    // Receiver-reported state
    // -----------------------------------------------------------------------

    pub fn announced_phase(&self) -> Option<&str> {
        self.announced_phase.as_deref()
    }

    /// Transfer id the last announcement was made for, if the receiver had
    /// one at the time.
    pub fn announced_transfer(&self) -> Option<&str> {
        self.announced_transfer.as_deref()
    }

    pub fn set_announced_phase(&mut self, phase: String, transfer_id: Option<String>) {
        self.announced_phase = Some(phase);
        self.announced_transfer = transfer_id;
    }

    /// Forget the previous round's announcement so a stale Complete cannot
    /// be mistaken for a skip.
    pub fn clear_announced_phase(&mut self) {
        self.announced_phase = None;
        self.announced_transfer = None;
    }

    /// Announced Complete for the transfer this link was last sent.
    pub fn is_complete_for_current(&self) -> bool {
        self.announced_phase() == Some(phases::COMPLETE)
            && self.announced_transfer.is_some()
            && self.announced_transfer() == self.transfer_id()
    }

    pub fn ready_for_map(&self) -> Option<i64> {
        self.ready_for_map
    }

    pub fn set_ready_for_map(&mut self, regeneration_id: i64) {
        self.ready_for_map = Some(regeneration_id);
    }

    pub fn transfer_id(&self) -> Option<&str> {
        self.transfer_id.as_deref()
    }

    pub fn set_transfer_id(&mut self, transfer_id: String) {
        self.transfer_id = Some(transfer_id);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Destroy the session: the bulk channel is dropped and the control
    /// channel closed so the receiver sees the loss and reconnects.
    pub fn mark_disconnected(&mut self) {
        self.disconnected = true;
        self.bulk = None;
        self.control.close();
    }
}

impl std::fmt::Debug for ClientLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLink")
            .field("conn", &self.conn)
            .field("identity", &self.identity)
            .field("bulk_connected", &self.bulk_connected())
            .field("announced_phase", &self.announced_phase)
            .field("announced_transfer", &self.announced_transfer)
            .field("disconnected", &self.disconnected)
            .finish()
    }
}
