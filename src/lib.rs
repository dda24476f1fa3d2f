//! Dungeon Sync
//!
//! World transfer and phase lockstep for a multiplayer voxel dungeon: the
//! host streams a serialized world to every receiver and resumes gameplay
//! only once all of them have rebuilt it.
//!
//! ## Architecture
//!
//! ```text
//! Host  (host/)                               Receiver  (receiver/)
//!   ├── TransferCoordinator                     ReceiverSession
//!   │     └── TransferWorker ×N ── chunks ──►     ├── ReceiverStateMachine  (join)
//!   └── ReadinessBarrier ◄──── phase names ──     └── RegenerationCoordinator
//!
//! framer.rs     chunk framing + slot reassembly
//! protocol.rs   every message crossing the boundary
//! transport.rs  channel traits (+ in-memory doubles)
//! net/          TCP wire codec and tokio runtimes
//! ```
//!
//! The state machines never touch sockets. `net` (feature `server`) plugs
//! them into TCP; `transport::memory` wires them together in-process.

// Core state machines are always available (no server feature needed).
pub mod error;
pub mod framer;
pub mod host;
pub mod protocol;
pub mod receiver;
pub mod transport;
pub mod types;
pub mod world;

// Wire codec is always present; the tokio runtimes inside require `server`.
pub mod net;

pub use error::{Result, SyncError};
pub use host::{Host, SharedHost};
pub use receiver::{ReceiverContext, ReceiverEvent, ReceiverSession};
pub use types::{HostPhase, SyncConfig, SyncStats, WorldId};
pub use world::{DungeonWorld, JsonWorldCodec, WorldCodec, WorldPayload, WorldSnapshot};
