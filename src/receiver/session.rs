//! Per-receiver router between the join path and the regeneration path.

use super::machine::ReceiverStateMachine;
use super::phase::JoinPhase;
use super::regen::{RegenOutcome, RegenerationCoordinator, RegenerationListener};
use super::{ReceiverContext, ReceiverEvent};
use crate::error::Result;
use crate::protocol::{HostMessage, MapChunk, ReceiverMessage};
use crate::transport::HostLink;
use crate::types::SyncConfig;
use log::{debug, info};
use std::time::Duration;

pub struct ReceiverSession {
    ctx: ReceiverContext,
    machine: ReceiverStateMachine,
    regen: RegenerationCoordinator,
    events: Vec<ReceiverEvent>,
    tick_count: u64,
}

impl ReceiverSession {
    pub fn new(config: SyncConfig, ctx: ReceiverContext) -> Self {
        Self {
            ctx,
            machine: ReceiverStateMachine::new(config),
            regen: RegenerationCoordinator::new(),
            events: Vec::new(),
            tick_count: 0,
        }
    }

    /// Step one of the identity handshake, sent once the control channel is
    /// up.
    pub fn identify(&mut self) -> Result<()> {
        info!(
            "Identifying as {} ('{}')",
            self.ctx.identity.client_unique_id, self.ctx.identity.client_name
        );
        let msg = ReceiverMessage::Identification(self.ctx.identity.clone());
        self.ctx.send(msg)
    }

    /// Swap in a fresh control link after the old one dropped. Work in
    /// flight on either path is abandoned and the receiver identifies
    /// again; the host restarts the transfer from its next begin.
    pub fn reconnect(&mut self, link: Box<dyn HostLink>) -> Result<()> {
        self.regen.abort(&mut self.ctx, "control channel lost");
        self.machine.connection_lost(&mut self.ctx);
        self.ctx.link = link;
        self.identify()
    }

    pub fn add_listener(&mut self, listener: Box<dyn RegenerationListener>) {
        self.regen.add_listener(listener);
    }

    pub fn machine(&self) -> &ReceiverStateMachine {
        &self.machine
    }

    pub fn regeneration(&self) -> &RegenerationCoordinator {
        &self.regen
    }

    pub fn context(&self) -> &ReceiverContext {
        &self.ctx
    }

    /// Phase name as last announced to the host.
    pub fn announced_phase(&self) -> &'static str {
        if self.regen.is_active() {
            self.regen.phase().as_str()
        } else {
            self.machine.phase().as_str()
        }
    }

    pub fn handle(&mut self, msg: HostMessage) -> Result<()> {
        debug!("<- {}", msg.name());
        match msg {
            HostMessage::TransferBegin(begin) => {
                if self.regen.is_active() {
                    self.regen.on_begin(&mut self.ctx, begin);
                } else {
                    self.machine.on_begin(&mut self.ctx, begin)?;
                }
            }
            HostMessage::TransferComplete(done) => {
                if self.regen.is_active() {
                    debug!("Transfer {} completed during regeneration; ignored", done.transfer_id);
                } else {
                    self.machine.on_transfer_complete(&done);
                }
            }
            HostMessage::Progress(progress) => {
                self.events.push(ReceiverEvent::PeerProgress(progress.progress));
            }
            HostMessage::RegenerationStart(start) => {
                // A receiver still joining picks the new world up from the
                // next begin message instead.
                if self.regen.is_active() || self.machine.phase() == JoinPhase::Complete {
                    self.regen.start(&mut self.ctx, start.regeneration_id);
                } else {
                    info!(
                        "Regeneration {} while joining ({}); waiting for next transfer",
                        start.regeneration_id,
                        self.machine.phase()
                    );
                }
            }
        }
        Ok(())
    }

    pub fn handle_chunk(&mut self, chunk: &MapChunk) -> Result<()> {
        if self.regen.is_active() {
            self.regen.on_chunk(&mut self.ctx, chunk);
            Ok(())
        } else {
            self.machine.on_chunk(&mut self.ctx, chunk)
        }
    }

    /// Advance whichever path is active and collect what happened.
    pub fn tick(&mut self, dt: Duration) -> Vec<ReceiverEvent> {
        self.tick_count += 1;

        if self.regen.is_active() {
            self.regen.tick(&mut self.ctx);
        } else {
            self.machine.tick(&mut self.ctx, dt);
        }

        match self.regen.take_outcome() {
            Some(RegenOutcome::Completed {
                world_id,
                begin,
                payload,
            }) => self.machine.adopt_world(world_id, begin, payload),
            Some(RegenOutcome::Failed { .. }) => self.machine.abandon_world(),
            None => {}
        }

        let mut events = std::mem::take(&mut self.events);
        events.extend(self.regen.drain_events());
        events.extend(self.machine.drain_events());
        events
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}
