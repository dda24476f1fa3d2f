//! World-transfer wire protocol.
//!
//! This module owns **every message that crosses the host/receiver boundary**.
//!
//! ## Channels
//!
//! | Channel  | Direction          | Carries                                  |
//! |----------|--------------------|------------------------------------------|
//! | control  | host → receiver    | [`HostMessage`]                          |
//! | control  | receiver → host    | [`ReceiverMessage`]                      |
//! | bulk     | host → receiver    | [`MapChunk`]                             |
//! | bulk     | receiver → host    | [`ClientIdentification`] (first frame)   |
//!
//! ## Design rules
//!
//! 1. Every struct is `Serialize + Deserialize` with snake_case JSON.
//! 2. Chunk payloads never go through JSON; the bulk framing carries them raw.
//! 3. Phase names travel as plain strings so either receiver path can be
//!    reported through the same `ClientStateChange`.
//! 4. Control messages are ordered relative to each other; chunk order is not
//!    relied upon (the index is authoritative).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Transfer messages  (host → receiver)
// ---------------------------------------------------------------------------

/// Announces a transfer on the control channel before any chunk is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapTransferBegin {
    pub transfer_id: String,
    /// Identifier of the world being sent; lets a receiver skip the download.
    pub world_id: String,
    pub total_chunks: i32,
    pub total_size_bytes: i64,
}

/// One slice of the world snapshot, carried on the bulk channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChunk {
    pub transfer_id: String,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub payload: Bytes,
}

/// Host has observed every receiver ready and resumed gameplay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapTransferComplete {
    pub transfer_id: String,
}

/// Per-client progress, broadcast at a fixed interval.
///
/// Values are chunks received so far, or the client's total when it is done
/// (or skipped the download). The recipient's own entry is never included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllClientProgress {
    pub progress: BTreeMap<String, i32>,
}

/// The world is changing while receivers are already playing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenerationStart {
    pub regeneration_id: i64,
}

// ---------------------------------------------------------------------------
// Receiver messages  (receiver → host)
// ---------------------------------------------------------------------------

/// Sent on every phase transition, and again on retry while waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStateChange {
    pub new_phase: String,
    pub old_phase: String,
    /// Transfer the receiver is working on, once it has seen a begin for
    /// it. Lets the host tell a current announcement from a late one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
}

/// Regeneration-path acknowledgment: old world released, ready for the new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReadyForMap {
    pub client_id: String,
    pub regeneration_id: i64,
    pub timestamp: i64,
}

/// First frame on either channel; correlates the bulk connection with the
/// receiver's control-channel identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentification {
    pub client_unique_id: String,
    pub client_name: String,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum HostMessage {
    TransferBegin(MapTransferBegin),
    TransferComplete(MapTransferComplete),
    Progress(AllClientProgress),
    RegenerationStart(RegenerationStart),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ReceiverMessage {
    Identification(ClientIdentification),
    StateChange(ClientStateChange),
    ReadyForMap(ClientReadyForMap),
}

impl HostMessage {
    pub fn name(&self) -> &'static str {
        match self {
            HostMessage::TransferBegin(_) => subjects::TRANSFER_BEGIN,
            HostMessage::TransferComplete(_) => subjects::TRANSFER_COMPLETE,
            HostMessage::Progress(_) => subjects::PROGRESS,
            HostMessage::RegenerationStart(_) => subjects::REGENERATION_START,
        }
    }
}

// ---------------------------------------------------------------------------
// Subject helpers
// ---------------------------------------------------------------------------

/// Message names, used in logs and as `HostMessage::name`.
pub mod subjects {
    pub const TRANSFER_BEGIN: &str = "map.transfer.begin";
    pub const TRANSFER_COMPLETE: &str = "map.transfer.complete";
    pub const CHUNK: &str = "map.chunk";
    pub const PROGRESS: &str = "map.progress";
    pub const REGENERATION_START: &str = "map.regeneration.start";

    pub const STATE_CHANGE: &str = "client.state_change";
    pub const READY_FOR_MAP: &str = "client.ready_for_map";
    pub const IDENTIFICATION: &str = "client.identification";
}

/// Phase names as announced in [`ClientStateChange`].
pub mod phases {
    pub const INITIATED: &str = "Initiated";
    pub const DISPOSE: &str = "Dispose";
    pub const CONNECT_BULK: &str = "ConnectBulk";
    pub const TRANSFER: &str = "Transfer";
    pub const REASSEMBLY: &str = "Reassembly";
    pub const BUILD_ASSETS: &str = "BuildAssets";
    pub const COMPLETE: &str = "Complete";
    pub const FAILED: &str = "Failed";

    pub const CLEANUP: &str = "Cleanup";
    pub const DOWNLOADING: &str = "Downloading";
    pub const REBUILDING: &str = "Rebuilding";

    /// Phases in which a receiver accepts chunks on its bulk channel.
    pub fn is_receiving(phase: &str) -> bool {
        phase == TRANSFER || phase == DOWNLOADING
    }
}
