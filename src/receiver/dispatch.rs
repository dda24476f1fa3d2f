//! Marshaling of graphics-bound work onto the thread that owns it.
//!
//! ```text
//! network / tick thread          │  owning (render) thread
//! ─────────────────────────────  │ ──────────────────────────
//! BuildJob::spawn(..)            │
//!   → dispatcher.post(job)  ───► │ MainThreadQueue::run_pending()
//! BuildJob::poll() each tick ◄── │   → builder.build(payload)
//! ```

use crate::error::{Result, SyncError};
use crate::world::{EntityState, WorldPayload};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Dispatcher: Send + Sync {
    fn post(&self, job: Job);
}

/// Runs every job on the posting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn post(&self, job: Job) {
        job();
    }
}

/// Jobs queue up until the owning thread calls [`MainThreadQueue::run_pending`].
pub struct MainThreadQueue {
    tx: mpsc::Sender<Job>,
    rx: Mutex<mpsc::Receiver<Job>>,
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl MainThreadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run everything posted so far. Returns the number of jobs executed.
    pub fn run_pending(&self) -> usize {
        let jobs: Vec<Job> = {
            let rx = self.rx.lock();
            rx.try_iter().collect()
        };
        let n = jobs.len();
        for job in jobs {
            job();
        }
        n
    }
}

impl Dispatcher for MainThreadQueue {
    fn post(&self, job: Job) {
        // The receiver half lives in `self`, so the send cannot fail.
        let _ = self.tx.send(job);
    }
}

// ---------------------------------------------------------------------------
// Asset builder
// ---------------------------------------------------------------------------

/// Renderer/physics collaborator that turns a world payload into live
/// resources.
pub trait AssetBuilder: Send + Sync {
    /// Release everything built for the previous world.
    fn dispose(&self) -> Result<()>;

    fn build(&self, payload: &WorldPayload) -> Result<()>;

    /// Re-create entity-dependent state after a live world change.
    fn reinitialize_entities(&self, _entities: &[EntityState]) -> Result<()> {
        Ok(())
    }
}

/// Builder that does nothing; used by headless receivers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBuilder;

impl AssetBuilder for NullBuilder {
    fn dispose(&self) -> Result<()> {
        Ok(())
    }

    fn build(&self, _payload: &WorldPayload) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Build job
// ---------------------------------------------------------------------------

/// A build posted to a [`Dispatcher`], polled for its result.
pub struct BuildJob {
    outcome: Arc<Mutex<Option<std::result::Result<(), String>>>>,
}

impl BuildJob {
    /// Post `build(payload)` and, when `with_entities` is set,
    /// `reinitialize_entities` right after it.
    pub fn spawn(
        dispatcher: &dyn Dispatcher,
        builder: Arc<dyn AssetBuilder>,
        payload: Arc<WorldPayload>,
        with_entities: bool,
    ) -> Self {
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        dispatcher.post(Box::new(move || {
            let mut result = builder.build(&payload);
            if result.is_ok() && with_entities {
                result = builder.reinitialize_entities(&payload.entities);
            }
            *slot.lock() = Some(result.map_err(|e| e.to_string()));
        }));
        Self { outcome }
    }

    /// `None` while the job has not run yet.
    pub fn poll(&self) -> Option<Result<()>> {
        self.outcome
            .lock()
            .take()
            .map(|r| r.map_err(SyncError::AssetBuild))
    }
}
