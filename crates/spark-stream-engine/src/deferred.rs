//! Deferred-op dispatcher.
//!
//! Lower-layer and filter callbacks run with the engine lock held and,
//! transitively, on whatever call stack the lower layer used to deliver
//! them (an epoll readiness loop, a completion port thread...). Calling a
//! user callback directly from there would mean the user callback could
//! re-enter the engine while the engine's own lock is still held further
//! up the stack — so instead the engine only ever *records* that a user
//! callback is due (setting a flag in `engine::EngineState`) and asks the
//! [`Dispatcher`] to run its drain routine once, off that stack entirely.
//!
//! Multiple inbound events arriving back-to-back each call
//! [`Dispatcher::request`]; only the first schedules a runner task, the
//! rest coalesce onto that same pending run (the "single reusable runner
//! handle" — one task drains whatever flags are set by the time it runs,
//! rather than one task per flag).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::platform::DeferredRunner;

/// Which deferred callbacks are currently pending. Read and cleared by the
/// same drain pass under the engine lock; see `engine::EngineState::deferred`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeferredFlags {
    /// The open completion is ready to run.
    pub open: bool,
    /// The close completion is ready to run.
    pub close: bool,
    /// A read (data or a latched read error) is ready to deliver.
    pub read: bool,
    /// `UserCallbacks::on_write_ready` is ready to deliver.
    pub write_ready: bool,
    /// `UserCallbacks::on_urgent` is ready to deliver.
    pub urgent: bool,
}

impl DeferredFlags {
    pub fn any(&self) -> bool {
        self.open || self.close || self.read || self.write_ready || self.urgent
    }
}

/// Coalesces repeated deferral requests onto a single pending runner task.
pub struct Dispatcher {
    runner: Arc<dyn DeferredRunner>,
    scheduled: AtomicBool,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn DeferredRunner>) -> Self {
        Self {
            runner,
            scheduled: AtomicBool::new(false),
        }
    }

    /// Ask for `drain` to run at least once more, off the calling stack.
    /// If a run is already pending, this is a no-op: that pending run will
    /// observe whatever flags this call set before returning.
    pub fn request(&self, drain: impl FnOnce() + Send + 'static) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runner.schedule(Box::new(drain));
    }

    /// Runs `task` off the calling stack unconditionally, bypassing the
    /// `request`/`clear` coalescing flag entirely. Used by callers that need
    /// a one-off deferral of their own — e.g. a `FilterCallbacks` method
    /// invoked reentrantly, while the engine lock is already held further up
    /// the calling thread's own stack — rather than folding into the main
    /// drain loop's single pending run.
    pub fn run_later(&self, task: impl FnOnce() + Send + 'static) {
        self.runner.schedule(Box::new(task));
    }

    /// Called by the drain routine itself, under the engine lock, once it
    /// has finished acting on every flag that was set when it started.
    /// Any flag set *during* the drain (by a racing LL/filter callback)
    /// will already have re-set `scheduled` via a fresh `request` call by
    /// the time this runs, so clearing here cannot lose a wakeup.
    pub fn clear(&self) {
        self.scheduled.store(false, Ordering::Release);
    }
}
