//! Receiver phases and their transition tables.
//!
//! | From          | Event            | To           |
//! |---------------|------------------|--------------|
//! | any           | `Begin`          | Initiated    |
//! | Initiated     | `WorldMatched`   | Complete     |
//! | Initiated     | `WorldDiffers`   | Dispose      |
//! | Dispose       | `Disposed`       | ConnectBulk  |
//! | ConnectBulk   | `BulkConnected`  | Transfer     |
//! | Transfer      | `Assembled`      | Reassembly   |
//! | Reassembly    | `Decoded`        | BuildAssets  |
//! | BuildAssets   | `Built`          | Complete     |
//! | in progress   | `Fault`          | Failed       |
//!
//! Anything else is rejected; the caller logs and drops the event.

use crate::protocol::phases;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinPhase {
    /// No transfer has been announced yet.
    Idle,
    Initiated,
    Dispose,
    ConnectBulk,
    Transfer,
    Reassembly,
    BuildAssets,
    Complete,
    Failed,
}

impl JoinPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinPhase::Idle => "Idle",
            JoinPhase::Initiated => phases::INITIATED,
            JoinPhase::Dispose => phases::DISPOSE,
            JoinPhase::ConnectBulk => phases::CONNECT_BULK,
            JoinPhase::Transfer => phases::TRANSFER,
            JoinPhase::Reassembly => phases::REASSEMBLY,
            JoinPhase::BuildAssets => phases::BUILD_ASSETS,
            JoinPhase::Complete => phases::COMPLETE,
            JoinPhase::Failed => phases::FAILED,
        }
    }

    /// Between Initiated and Complete.
    pub fn in_progress(self) -> bool {
        !matches!(self, JoinPhase::Idle | JoinPhase::Complete | JoinPhase::Failed)
    }
}

impl std::fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinEvent {
    Begin,
    WorldMatched,
    WorldDiffers,
    Disposed,
    BulkConnected,
    Assembled,
    Decoded,
    Built,
    Fault,
}

pub fn join_next(from: JoinPhase, event: JoinEvent) -> Option<JoinPhase> {
    use JoinEvent as E;
    use JoinPhase as P;
    match (from, event) {
        (_, E::Begin) => Some(P::Initiated),
        (P::Initiated, E::WorldMatched) => Some(P::Complete),
        (P::Initiated, E::WorldDiffers) => Some(P::Dispose),
        (P::Dispose, E::Disposed) => Some(P::ConnectBulk),
        (P::ConnectBulk, E::BulkConnected) => Some(P::Transfer),
        (P::Transfer, E::Assembled) => Some(P::Reassembly),
        (P::Reassembly, E::Decoded) => Some(P::BuildAssets),
        (P::BuildAssets, E::Built) => Some(P::Complete),
        (p, E::Fault) if p.in_progress() => Some(P::Failed),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Regeneration path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RegenPhase {
    #[default]
    Idle,
    Cleanup,
    Downloading,
    Rebuilding,
    Complete,
    Failed,
}

impl RegenPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RegenPhase::Idle => "Idle",
            RegenPhase::Cleanup => phases::CLEANUP,
            RegenPhase::Downloading => phases::DOWNLOADING,
            RegenPhase::Rebuilding => phases::REBUILDING,
            RegenPhase::Complete => phases::COMPLETE,
            RegenPhase::Failed => phases::FAILED,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RegenPhase::Complete | RegenPhase::Failed)
    }
}

impl std::fmt::Display for RegenPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal forward steps of the regeneration path. Idle and the terminal
/// phases may only start a new regeneration.
pub fn regen_allows(from: RegenPhase, to: RegenPhase) -> bool {
    use RegenPhase as P;
    matches!(
        (from, to),
        (P::Idle | P::Complete | P::Failed, P::Cleanup)
            | (P::Cleanup, P::Downloading)
            | (P::Downloading, P::Rebuilding)
            | (P::Rebuilding, P::Complete)
            | (P::Cleanup | P::Downloading | P::Rebuilding, P::Failed)
    )
}

/// Regeneration progress as one 0..=1 figure: cleanup covers the first
/// tenth, download the next eight tenths, rebuild the last tenth.
pub fn regen_progress(phase: RegenPhase, fraction: f32) -> f32 {
    let f = fraction.clamp(0.0, 1.0);
    match phase {
        RegenPhase::Idle => 0.0,
        RegenPhase::Cleanup => 0.1 * f,
        RegenPhase::Downloading => 0.1 + 0.8 * f,
        RegenPhase::Rebuilding => 0.9 + 0.1 * f,
        RegenPhase::Complete => 1.0,
        RegenPhase::Failed => 0.0,
    }
}
