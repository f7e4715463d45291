//! Single-flight Executors
//!
//! A [`SingleFlight`] slot runs at most one task at a time: starting a new
//! run cancels the previous one first. "Latest write wins, in-flight stale
//! work is abandoned."
//!
//! Each run gets a scope carrying a [`SupersedeGuard`]. When the run is
//! replaced its guard is tripped before the new run starts, and every write
//! made through a tripped scope is refused with `Superseded`. Aborting the
//! task alone would leave a window where a stale run that is already past
//! its last suspension point commits a write.
//!
//! The slot exposes an `is_pending` state: `true` while a run occupies the
//! slot, `false` once the latest run ends.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::batch::Task;
use crate::error::Result;
use crate::reactive::{NodeId, Registry, Runtime, Scope, State};

/// Trip-wire shared between a single-flight slot and one of its runs.
#[derive(Debug, Clone)]
pub(crate) struct SupersedeGuard {
    slot: Arc<str>,
    tripped: Arc<AtomicBool>,
}

impl SupersedeGuard {
    pub(crate) fn new(slot: &str) -> Self {
        Self {
            slot: Arc::from(slot),
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub(crate) fn slot(&self) -> &str {
        &self.slot
    }
}

struct Flight {
    generation: u64,
    /// `None` until the run has been spawned.
    task: Option<Task>,
    guard: SupersedeGuard,
}

struct SingleFlightInner {
    name: String,
    pending: State<bool>,
    slot: Mutex<Option<Flight>>,
    generation: AtomicU64,
}

impl SingleFlightInner {
    /// Release the slot if `generation` still owns it.
    fn finish(&self, generation: u64, scope: &Scope) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|flight| flight.generation) != Some(generation) {
            return;
        }
        *slot = None;
        // Still under the slot lock so a run starting concurrently cannot
        // have its `true` overwritten.
        if let Err(err) = self.pending.set(scope, false) {
            warn!(slot = %self.name, error = %err, "failed to clear pending flag");
        }
    }
}

/// Clears the slot when a run ends, including when it is aborted.
struct Release {
    inner: Arc<SingleFlightInner>,
    generation: u64,
    scope: Scope,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.inner.finish(self.generation, &self.scope);
    }
}

/// A cancel-superseding executor slot.
#[derive(Clone)]
pub struct SingleFlight {
    inner: Arc<SingleFlightInner>,
}

impl SingleFlight {
    pub fn new(runtime: &Runtime, name: impl Into<String>) -> Self {
        Self::with_registry(runtime.registry(), name.into())
    }

    pub(crate) fn with_registry(registry: &Arc<Registry>, name: String) -> Self {
        let pending = State::with_registry(registry, format!("{name}:pending"), NodeId::new(), false);
        Self {
            inner: Arc::new(SingleFlightInner {
                name,
                pending,
                slot: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// State that is `true` while a run occupies the slot.
    pub fn is_pending(&self) -> State<bool> {
        self.inner.pending.clone()
    }

    /// Start a run, cancelling whichever run currently occupies the slot.
    ///
    /// `f` receives the run's scope: the caller's consumer and batch plus a
    /// guard that refuses writes once this run is superseded. The run is
    /// spawned into the caller's batch, so joining that batch waits for it.
    pub fn run<F, Fut>(&self, scope: &Scope, f: F) -> Result<Task>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let batch = scope.require_batch(&self.inner.name)?.clone();
        let scope = scope.without_guard();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = SupersedeGuard::new(&self.inner.name);
        let fut = f(scope.with_guard(guard.clone()));

        // The slot lock is never held while a task is cancelled or spawned:
        // either can drop a run's future, and its `Release`, on this thread.
        let (previous, pending) = {
            let mut slot = self.inner.slot.lock();
            let previous = slot.replace(Flight {
                generation,
                task: None,
                guard: guard.clone(),
            });
            if let Some(previous) = &previous {
                previous.guard.trip();
                debug!(slot = %self.inner.name, superseded = previous.generation, by = generation, "superseded in-flight run");
            }
            let pending = self.inner.pending.set(&scope, true);
            if pending.is_err() {
                *slot = None;
            }
            (previous, pending)
        };
        if let Some(task) = previous.and_then(|flight| flight.task) {
            task.cancel();
        }
        pending?;

        let release = Release {
            inner: Arc::clone(&self.inner),
            generation,
            scope,
        };
        let task = batch.spawn(async move {
            let _release = release;
            fut.await
        });

        let superseded = {
            let mut slot = self.inner.slot.lock();
            if let Some(flight) = slot.as_mut().filter(|flight| flight.generation == generation) {
                flight.task = Some(task.clone());
            }
            guard.is_tripped()
        };
        if superseded {
            task.cancel();
        }
        Ok(task)
    }

    /// Cancel the current run, if any.
    ///
    /// The slot stays occupied until the run's task ends, so `is_pending`
    /// drops back to `false` only once the run has actually stopped.
    pub fn cancel(&self) {
        let task = {
            let slot = self.inner.slot.lock();
            slot.as_ref().and_then(|flight| {
                flight.guard.trip();
                flight.task.clone()
            })
        };
        if let Some(task) = task {
            task.cancel();
        }
    }
}

impl fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("name", &self.inner.name)
            .field("pending", &self.inner.pending.get_untracked())
            .finish()
    }
}
