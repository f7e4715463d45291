//! Consumers
//!
//! A consumer is the identity of "a reader": a UI component instance, a
//! query's internal tracker, a command, or an explicit `consume` scope.
//! Every tracked read is attributed to the consumer in scope, and every
//! change a consumer depends on lands on its change channel.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, Span};

use super::channel::{Change, ChangeChannel, ChangeValue, Changes};
use super::registry::Registry;
use crate::task::Batch;

/// Unique identifier for a consumer.
///
/// Edges in the registry refer to consumers by ID only, so a node never
/// keeps a consumer alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    /// Generate a new unique consumer ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct ConsumerInner {
    id: ConsumerId,
    key: String,
    channel: ChangeChannel,
    retired: AtomicBool,
    registry: Arc<Registry>,
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        self.channel.close();
        self.registry.retire(self.id);
    }
}

/// A reader identity that accumulates dependency edges and receives
/// change notifications.
///
/// Cloning a `Consumer` yields another handle to the same identity. When
/// the last handle is dropped the consumer is retired.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub(crate) fn new(registry: &Arc<Registry>, key: impl Into<String>) -> Self {
        let inner = Arc::new(ConsumerInner {
            id: ConsumerId::new(),
            key: key.into(),
            channel: ChangeChannel::new(),
            retired: AtomicBool::new(false),
            registry: Arc::clone(registry),
        });
        registry.register(inner.id, Arc::downgrade(&inner));
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ConsumerInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Enqueue a change on this consumer's channel.
    ///
    /// Never blocks and never drops; a retired consumer ignores it.
    pub fn notify(&self, value: ChangeValue, batch: &Batch, span: &Span) {
        self.inner.channel.publish(Change {
            value,
            batch: batch.clone(),
            span: span.clone(),
        });
    }

    /// Open a new reader over this consumer's changes.
    ///
    /// The reader sees every change published after this call.
    pub fn changes(&self) -> Changes {
        self.inner.channel.subscribe()
    }

    /// Retire the consumer: close its channel and remove it from every
    /// state and query it depends on. Idempotent.
    pub fn retire(&self) {
        if self.inner.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.channel.close();
        self.inner.registry.retire(self.inner.id);
        debug!(consumer = %self.inner.key, "consumer retired");
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::SeqCst)
    }

    /// Changes delivered to this consumer so far.
    pub(crate) fn published(&self) -> u64 {
        self.inner.channel.published()
    }
}

impl PartialEq for Consumer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Consumer {}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("retired", &self.is_retired())
            .finish()
    }
}
