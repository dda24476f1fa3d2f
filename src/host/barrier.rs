//! Host readiness barrier: gameplay resumes only once every connected
//! receiver has announced Complete for the transfer it was last sent. No
//! host-side timeout.

use crate::host::link::{ClientLink, ConnectionId};
use log::info;
use std::collections::BTreeMap;
use std::time::Duration;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierStatus {
    Released,
    /// Labels of receivers not yet Complete, with their last phase.
    Waiting(Vec<(String, Option<String>)>),
}

#[derive(Debug, Default)]
pub struct ReadinessBarrier {
    waited: Duration,
    since_report: Duration,
}

impl ReadinessBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.waited = Duration::ZERO;
        self.since_report = Duration::ZERO;
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn poll(&mut self, links: &BTreeMap<ConnectionId, ClientLink>, dt: Duration) -> BarrierStatus {
        let pending = pending(links);
        if pending.is_empty() {
            return BarrierStatus::Released;
        }

        self.waited += dt;
        self.since_report += dt;
        if self.since_report >= REPORT_INTERVAL {
            self.since_report = Duration::ZERO;
            info!(
                "Still waiting {:.0?} for {} receiver(s): {:?}",
                self.waited,
                pending.len(),
                pending
            );
        }
        BarrierStatus::Waiting(pending)
    }
}

fn pending(links: &BTreeMap<ConnectionId, ClientLink>) -> Vec<(String, Option<String>)> {
    links
        .values()
        .filter(|l| !l.is_disconnected())
        .filter(|l| !l.is_complete_for_current())
        .map(|l| (l.label(), l.announced_phase().map(str::to_string)))
        .collect()
}
