//! Query Implementation
//!
//! A Query is a named derived read. It evaluates a read expression under a
//! private internal consumer, so the states the expression touches record
//! the *query* as their dependent, and it keeps its own set of subscribers:
//! every external consumer that has read it.
//!
//! # How Queries Work
//!
//! 1. [`Query::read`] adds the caller's consumer to the subscribers, then
//!    evaluates the expression under the internal consumer and caches the
//!    result.
//!
//! 2. A background forwarder drains the internal consumer's channel. For
//!    every upstream change it re-evaluates the expression, caches the new
//!    value, and notifies every subscriber with the *recomputed* value under
//!    the batch of the upstream change. A recomputation equal to the value
//!    last forwarded (or first read) notifies nobody.
//!
//! 3. If re-evaluation fails, the failure is logged and the forwarder stops.
//!    Reads keep working; only propagation for this query ends.
//!
//! The cached value is versioned by the number of upstream changes seen
//! when its evaluation started, so a slow read never replaces a value the
//! forwarder computed for a later change.
//!
//! Subscribers are never pruned automatically. Retiring a consumer or
//! dropping a [`Subscription`] are the only ways out of the set.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{error, info_span, trace, Span};

use super::channel::{Change, ChangeValue};
use super::consumer::{Consumer, ConsumerId};
use super::registry::{NodeId, Registry};
use super::runtime::Runtime;
use super::scope::Scope;
use crate::error::{Error, Result};

type ReadExpr<V> = dyn Fn(&Scope) -> Result<V> + Send + Sync;

struct Cache<V> {
    latest: Option<V>,
    /// Upstream changes published before `latest` was computed.
    latest_version: u64,
    /// What subscribers were last given.
    forwarded: Option<V>,
    /// Upstream changes the forwarder has handled.
    processed: u64,
}

impl<V: Clone + PartialEq> Cache<V> {
    fn new() -> Self {
        Self {
            latest: None,
            latest_version: 0,
            forwarded: None,
            processed: 0,
        }
    }

    /// Keep `value` unless a newer version is already cached.
    fn store(&mut self, value: &V, version: u64) {
        if version >= self.latest_version {
            self.latest = Some(value.clone());
            self.latest_version = version;
        }
    }

    /// Record `value` as forwarded. Returns false if subscribers already
    /// have it.
    fn forward(&mut self, value: &V) -> bool {
        if self.forwarded.as_ref() == Some(value) {
            return false;
        }
        self.forwarded = Some(value.clone());
        true
    }
}

struct QueryInner<V> {
    key: String,
    node: NodeId,
    internal: Consumer,
    expr: Box<ReadExpr<V>>,
    cache: Mutex<Cache<V>>,
    forwarding: AtomicBool,
    forwarder: Mutex<Option<AbortHandle>>,
    registry: Arc<Registry>,
}

impl<V> Drop for QueryInner<V> {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.get_mut().take() {
            forwarder.abort();
        }
        self.internal.retire();
        self.registry.forget_node(self.node);
    }
}

impl<V> QueryInner<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn evaluate(&self, scope: &Scope) -> Result<V> {
        let before = self.internal.published();
        let value = (self.expr)(&scope.with_consumer(&self.internal))?;
        let after = self.internal.published();

        let mut cache = self.cache.lock();
        cache.store(&value, before);
        // A first read sets the baseline for forwarding, as long as no
        // upstream change is still on its way to the forwarder.
        if cache.forwarded.is_none() && before == after && after == cache.processed {
            cache.forwarded = Some(value.clone());
        }
        Ok(value)
    }

    /// Recompute after an upstream change and push the result to every
    /// subscriber under the change's batch.
    fn forward(&self, change: &Change, span: &Span) -> Result<()> {
        let scope = Scope::new().with_batch(&change.batch);
        let result = (self.expr)(&scope.with_consumer(&self.internal));

        let mut cache = self.cache.lock();
        cache.processed += 1;
        let value = result.map_err(|source| Error::ForwarderFailed {
            key: self.key.clone(),
            source: Box::new(source),
        })?;
        let version = cache.processed;
        cache.store(&value, version);
        if !cache.forward(&value) {
            trace!(query = %self.key, "recomputed value unchanged");
            return Ok(());
        }
        drop(cache);

        let value = ChangeValue::new(value);
        for subscriber in self.registry.dependents(self.node) {
            subscriber.notify(value.clone(), &change.batch, span);
        }
        Ok(())
    }
}

/// A named derived read, re-published to its subscribers on upstream change.
///
/// # Example
///
/// ```rust,ignore
/// let count = State::new(&runtime, 0);
/// let source = count.clone();
/// let doubled = Query::new(&runtime, "doubled", move |scope| Ok(source.read(scope)? * 2));
///
/// assert_eq!(doubled.read(&scope)?, 0);
/// ```
pub struct Query<V> {
    inner: Arc<QueryInner<V>>,
}

impl<V> Query<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a query and start its forwarder on the runtime's executor.
    pub fn new<F>(runtime: &Runtime, key: impl Into<String>, expr: F) -> Self
    where
        F: Fn(&Scope) -> Result<V> + Send + Sync + 'static,
    {
        Self::with_registry(runtime.registry(), runtime.handle(), key.into(), Box::new(expr))
    }

    pub(crate) fn with_registry(
        registry: &Arc<Registry>,
        handle: &Handle,
        key: String,
        expr: Box<ReadExpr<V>>,
    ) -> Self {
        let internal = Consumer::new(registry, format!("query:{key}"));
        // Subscribe before anything can read through the query so no
        // upstream change is missed.
        let mut changes = internal.changes();

        let inner = Arc::new(QueryInner {
            key,
            node: NodeId::new(),
            internal,
            expr,
            cache: Mutex::new(Cache::new()),
            forwarding: AtomicBool::new(true),
            forwarder: Mutex::new(None),
            registry: Arc::clone(registry),
        });

        let weak = Arc::downgrade(&inner);
        let forwarder = handle.spawn(async move {
            while let Some(change) = changes.recv().await {
                let Some(query) = weak.upgrade() else {
                    break;
                };
                let span = info_span!(parent: &change.span, "query", key = %query.key);
                let result = span.in_scope(|| query.forward(&change, &span));
                if let Err(err) = result {
                    error!(query = %query.key, error = %err, "query forwarder stopped");
                    query.forwarding.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });
        *inner.forwarder.lock() = Some(forwarder.abort_handle());

        Self { inner }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn id(&self) -> NodeId {
        self.inner.node
    }

    /// Read the query's current value, subscribing the scope's consumer.
    ///
    /// The expression runs under the query's internal consumer with the
    /// caller's batch. Failures are returned as `QueryFailed`.
    pub fn read(&self, scope: &Scope) -> Result<V> {
        let consumer = scope.require_consumer(&self.inner.key)?;
        let tracked = self.inner.registry.add_dependency(self.inner.node, consumer);
        if self.inner.registry.traces_reads() {
            trace!(query = %self.inner.key, consumer = %consumer.key(), tracked, "consume query");
        }
        self.inner.evaluate(scope).map_err(|source| Error::QueryFailed {
            key: self.inner.key.clone(),
            source: Box::new(source),
        })
    }

    /// The most recently computed value, if the query has been evaluated.
    pub fn latest(&self) -> Option<V> {
        self.inner.cache.lock().latest.clone()
    }

    /// Subscribe `consumer` without evaluating the query. Dropping the
    /// returned handle unsubscribes it.
    pub fn subscribe(&self, consumer: &Consumer) -> Subscription {
        self.inner.registry.add_dependency(self.inner.node, consumer);
        Subscription {
            registry: Arc::clone(&self.inner.registry),
            node: self.inner.node,
            consumer: consumer.id(),
        }
    }

    /// Remove `consumer` from the subscribers. Returns whether it was one.
    pub fn unsubscribe(&self, consumer: &Consumer) -> bool {
        self.inner
            .registry
            .remove_dependency(self.inner.node, consumer.id())
    }

    pub fn is_subscribed(&self, consumer: &Consumer) -> bool {
        self.inner.registry.is_dependent(self.inner.node, consumer.id())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.dependent_count(self.inner.node)
    }

    /// The consumer the expression is evaluated under.
    pub fn internal_consumer(&self) -> &Consumer {
        &self.inner.internal
    }

    /// Whether upstream changes are still being forwarded.
    pub fn is_forwarding(&self) -> bool {
        self.inner.forwarding.load(Ordering::SeqCst)
    }
}

impl<V> Clone for Query<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Debug> Debug for Query<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("latest", &self.inner.cache.lock().latest)
            .field("subscriber_count", &self.inner.registry.dependent_count(self.inner.node))
            .field("forwarding", &self.inner.forwarding.load(Ordering::SeqCst))
            .finish()
    }
}

/// Explicit query subscription. Dropping it removes the subscriber.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Arc<Registry>,
    node: NodeId,
    consumer: ConsumerId,
}

impl Subscription {
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove_dependency(self.node, self.consumer);
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("node", &self.node)
            .field("consumer", &self.consumer)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
