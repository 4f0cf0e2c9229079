//! Injected platform collaborators: a one-shot [`Timer`] and a
//! [`DeferredRunner`] the engine uses to move user-visible callbacks out of
//! the lower layer/filter's own call stack. Kept as traits rather than
//! hard-wiring Tokio so the engine compiles against any executor; the
//! `tokio-platform` feature supplies ready-made implementations.

use std::time::Duration;

/// A single-shot, re-armable timer.
///
/// Implementations must guarantee that once [`Timer::cancel`] (or
/// [`Timer::stop_and_drain`]) returns, no fire scheduled by an earlier
/// [`Timer::arm`] call will invoke its closure — this is what lets the
/// engine drop its last reference to itself right after stopping the
/// timer, per the lifetime manager's drain-before-free rule.
pub trait Timer: Send + Sync {
    /// Arm the timer to fire once after `delay`. A prior pending fire, if
    /// any, is superseded (its closure will not run).
    fn arm(&self, delay: Duration, fire: Box<dyn FnOnce() + Send>);

    /// Cancel any pending fire. A no-op if nothing is armed.
    fn cancel(&self);

    /// Cancel any pending fire and invoke `done` once it is guaranteed no
    /// superseded fire is still in flight.
    fn stop_and_drain(&self, done: Box<dyn FnOnce() + Send>) {
        self.cancel();
        done();
    }
}

/// Schedules a closure to run off the current call stack, used to defer
/// user-visible callbacks out from under the lower layer/filter callback
/// that triggered them (see `engine::deferred`).
pub trait DeferredRunner: Send + Sync {
    fn schedule(&self, task: Box<dyn FnOnce() + Send>);
}

#[cfg(feature = "tokio-platform")]
pub mod tokio_platform {
    //! Tokio-backed [`Timer`]/[`DeferredRunner`], provided for convenience.
    //! Both require a Tokio runtime to be entered when their methods are
    //! called (they use [`tokio::spawn`]/[`tokio::time::sleep`]).

    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{DeferredRunner, Timer};

    /// Generation-fenced timer: arming bumps a generation counter, and a
    /// fire only runs if the generation is still current when its sleep
    /// completes. This makes `cancel`/`stop_and_drain` synchronous — no
    /// need to await an in-flight sleep task, since the fence already
    /// guarantees it is inert.
    #[derive(Default)]
    pub struct TokioTimer {
        generation: Arc<Mutex<u64>>,
    }

    impl TokioTimer {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Timer for TokioTimer {
        fn arm(&self, delay: Duration, fire: Box<dyn FnOnce() + Send>) {
            let my_generation = {
                let mut guard = self.generation.lock();
                *guard += 1;
                *guard
            };
            let generation = Arc::clone(&self.generation);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if *generation.lock() == my_generation {
                    fire();
                }
            });
        }

        fn cancel(&self) {
            *self.generation.lock() += 1;
        }
    }

    /// Runs deferred tasks on a freshly spawned Tokio task each, which is
    /// enough to guarantee they execute outside any LL/filter callback's
    /// call stack.
    #[derive(Default)]
    pub struct TokioDeferredRunner;

    impl TokioDeferredRunner {
        pub fn new() -> Self {
            Self
        }
    }

    impl DeferredRunner for TokioDeferredRunner {
        fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
            // Fire-and-forget: a fresh task is enough to get off the
            // caller's stack. The task reports its own outcome via user
            // callbacks, so the `JoinHandle` is intentionally dropped.
            drop(tokio::task::spawn_blocking(move || task()));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[tokio::test]
        async fn superseded_fire_never_runs() {
            let timer = TokioTimer::new();
            let fired = Arc::new(AtomicUsize::new(0));

            let f1 = Arc::clone(&fired);
            timer.arm(Duration::from_millis(50), Box::new(move || {
                f1.fetch_add(1, Ordering::SeqCst);
            }));

            let f2 = Arc::clone(&fired);
            timer.arm(Duration::from_millis(1), Box::new(move || {
                f2.fetch_add(1, Ordering::SeqCst);
            }));

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn cancel_suppresses_a_pending_fire() {
            let timer = TokioTimer::new();
            let fired = Arc::new(AtomicUsize::new(0));
            let f1 = Arc::clone(&fired);
            timer.arm(Duration::from_millis(10), Box::new(move || {
                f1.fetch_add(1, Ordering::SeqCst);
            }));
            timer.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        }
    }
}
