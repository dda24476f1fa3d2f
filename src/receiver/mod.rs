//! Receiver: the side that downloads and rebuilds the world.
//!
//! ```text
//! ReceiverSession  (session.rs)  routes host messages and chunks
//!   ├── ReceiverStateMachine   (machine.rs)  join path
//!   └── RegenerationCoordinator (regen.rs)   live world change path
//! ReceiverContext                            channels + collaborators
//! ```
//!
//! Both paths share one [`ReceiverContext`]; only one of them is active at
//! a time, so they borrow it per call instead of owning a copy.

pub mod dispatch;
pub mod machine;
pub mod phase;
pub mod regen;
pub mod session;

pub use dispatch::{AssetBuilder, BuildJob, Dispatcher, InlineDispatcher, MainThreadQueue, NullBuilder};
pub use machine::ReceiverStateMachine;
pub use phase::{JoinEvent, JoinPhase, RegenPhase};
pub use regen::{RegenerationCoordinator, RegenerationListener};
pub use session::ReceiverSession;

use crate::protocol::{ClientIdentification, ClientStateChange, ReceiverMessage};
use crate::transport::{BulkConnector, HostLink};
use crate::types::WorldId;
use crate::world::WorldCodec;
use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything either receiver path needs to talk to the host and to the
/// renderer.
pub struct ReceiverContext {
    pub identity: ClientIdentification,
    pub link: Box<dyn HostLink>,
    pub connector: Box<dyn BulkConnector>,
    pub builder: Arc<dyn AssetBuilder>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub codec: Arc<dyn WorldCodec>,
}

impl ReceiverContext {
    pub fn send(&mut self, msg: ReceiverMessage) -> crate::error::Result<()> {
        self.link.send(msg)
    }

    /// Report a phase transition. A lost announcement is covered by the
    /// Complete-phase retry, so failures only warn.
    pub fn announce(&mut self, old_phase: &str, new_phase: &str, transfer_id: Option<&str>) {
        let msg = ReceiverMessage::StateChange(ClientStateChange {
            new_phase: new_phase.to_string(),
            old_phase: old_phase.to_string(),
            transfer_id: transfer_id.map(str::to_string),
        });
        if let Err(e) = self.link.send(msg) {
            warn!("Failed to announce {} -> {}: {}", old_phase, new_phase, e);
        }
    }
}

/// Observable outcome of receiver activity, drained by the embedding
/// application each tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    Phase {
        from: &'static str,
        to: &'static str,
    },
    /// Own download progress.
    Progress { received: u32, total: u32 },
    /// Other receivers' progress as broadcast by the host.
    PeerProgress(BTreeMap<String, i32>),
    /// World is built (or was already held) and gameplay may resume locally.
    WorldReady { world_id: WorldId, skipped: bool },
    /// Host confirmed every receiver is ready.
    HostReleased { transfer_id: String },
    Failed { reason: String },
    /// Host never acknowledged readiness; operator attention needed.
    Stalled,
}
