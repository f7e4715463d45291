//! State Containers
//!
//! A [`State`] is the source of all change in the engine. It holds a value
//! and, through the registry, the set of consumers that depend on it.
//!
//! # How States Work
//!
//! 1. A tracked [`State::read`] registers the scope's consumer as a
//!    dependent. Reads outside a consumer scope are refused.
//!
//! 2. [`State::set`] and [`State::update`] store a new value. Writes outside
//!    a batch scope are refused, so every change has a cause.
//!
//! 3. If the new value equals the old one nothing is notified. Otherwise
//!    every dependent, in the order it first read the state, gets the new
//!    value enqueued on its channel, tagged with the write's batch and a
//!    `state:change` span.
//!
//! Reads and writes are synchronous and never suspend. The value lock is
//! released before any dependent is notified.

use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info_span, trace};

use super::channel::ChangeValue;
use super::consumer::Consumer;
use super::registry::{NodeId, Registry};
use super::runtime::Runtime;
use super::scope::Scope;
use crate::error::Result;

struct StateInner<V> {
    node: NodeId,
    label: String,
    value: RwLock<V>,
    registry: Arc<Registry>,
}

impl<V> Drop for StateInner<V> {
    fn drop(&mut self) {
        self.registry.forget_node(self.node);
    }
}

/// A mutable cell with tracked dependents.
///
/// # Example
///
/// ```rust,ignore
/// let count = State::new(&runtime, 0);
///
/// let value = count.read(&scope)?;
/// count.update(&scope, |v| v + 1)?;
/// ```
pub struct State<V> {
    inner: Arc<StateInner<V>>,
}

impl<V> State<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a state owned by `runtime`.
    pub fn new(runtime: &Runtime, initial: V) -> Self {
        let node = NodeId::new();
        Self::with_registry(runtime.registry(), node.to_string(), node, initial)
    }

    /// Create a state with a readable label used in errors and logs.
    pub fn named(runtime: &Runtime, label: impl Into<String>, initial: V) -> Self {
        Self::with_registry(runtime.registry(), label.into(), NodeId::new(), initial)
    }

    pub(crate) fn with_registry(
        registry: &Arc<Registry>,
        label: String,
        node: NodeId,
        initial: V,
    ) -> Self {
        Self {
            inner: Arc::new(StateInner {
                node,
                label,
                value: RwLock::new(initial),
                registry: Arc::clone(registry),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.node
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Read the value, registering the scope's consumer as a dependent.
    pub fn read(&self, scope: &Scope) -> Result<V> {
        let consumer = scope.require_consumer(&self.inner.label)?;
        let tracked = self.inner.registry.add_dependency(self.inner.node, consumer);
        if self.inner.registry.traces_reads() {
            trace!(state = %self.inner.label, consumer = %consumer.key(), tracked, "tracked read");
        }
        Ok(self.inner.value.read().clone())
    }

    /// Read the value without establishing a dependency.
    pub fn get_untracked(&self) -> V {
        self.inner.value.read().clone()
    }

    /// Store `value` and notify dependents if it differs from the old value.
    pub fn set(&self, scope: &Scope, value: V) -> Result<()> {
        self.update(scope, move |_| value)
    }

    /// Store `f(old)` and notify dependents if it differs from `old`.
    pub fn update<F>(&self, scope: &Scope, f: F) -> Result<()>
    where
        F: FnOnce(&V) -> V,
    {
        let batch = scope.require_batch(&self.inner.label)?;
        scope.check_guard()?;

        let changed = {
            let mut guard = self.inner.value.write();
            let next = f(&guard);
            if *guard == next {
                *guard = next;
                None
            } else {
                *guard = next.clone();
                Some(next)
            }
        };

        let Some(next) = changed else {
            return Ok(());
        };

        let span = info_span!("state:change", state = %self.inner.label, batch = %batch.name());
        let value = ChangeValue::new(next);
        for consumer in self.inner.registry.dependents(self.inner.node) {
            consumer.notify(value.clone(), batch, &span);
        }
        Ok(())
    }

    /// Number of consumers currently depending on this state.
    pub fn dependent_count(&self) -> usize {
        self.inner.registry.dependent_count(self.inner.node)
    }

    pub fn is_dependent(&self, consumer: &Consumer) -> bool {
        self.inner.registry.is_dependent(self.inner.node, consumer.id())
    }
}

impl<V> Clone for State<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Debug> Debug for State<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("node", &self.inner.node)
            .field("label", &self.inner.label)
            .field("value", &*self.inner.value.read())
            .field("dependent_count", &self.inner.registry.dependent_count(self.inner.node))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::task::Batch;

    struct Fixture {
        registry: Arc<Registry>,
        batch: Batch,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(Registry::new()),
                batch: Batch::new("test"),
            }
        }

        fn state<V: Clone + PartialEq + Send + Sync + 'static>(&self, value: V) -> State<V> {
            State::with_registry(&self.registry, "value".into(), NodeId::new(), value)
        }

        fn consumer(&self, key: &str) -> Consumer {
            Consumer::new(&self.registry, key)
        }

        fn scope(&self, consumer: &Consumer) -> Scope {
            Scope::for_consumer(consumer).with_batch(&self.batch)
        }
    }

    #[test]
    fn state_read_and_set() {
        let fx = Fixture::new();
        let reader = fx.consumer("reader");
        let scope = fx.scope(&reader);
        let state = fx.state(0);

        assert_eq!(state.read(&scope).unwrap(), 0);
        state.set(&scope, 42).unwrap();
        assert_eq!(state.read(&scope).unwrap(), 42);
    }

    #[test]
    fn state_update() {
        let fx = Fixture::new();
        let reader = fx.consumer("reader");
        let scope = fx.scope(&reader);
        let state = fx.state(10);

        state.update(&scope, |v| v + 5).unwrap();
        assert_eq!(state.get_untracked(), 15);
    }

    #[test]
    fn read_without_consumer_fails() {
        let fx = Fixture::new();
        let state = fx.state(1);

        let err = state.read(&Scope::new().with_batch(&fx.batch)).unwrap_err();
        assert!(matches!(err, Error::NoConsumerInScope { target } if target == "value"));
    }

    #[test]
    fn write_without_batch_fails_and_keeps_value() {
        let fx = Fixture::new();
        let reader = fx.consumer("reader");
        let state = fx.state(1);

        let err = state.set(&Scope::for_consumer(&reader), 2).unwrap_err();
        assert!(matches!(err, Error::NoBatchInScope { .. }));
        assert_eq!(state.get_untracked(), 1);
    }

    #[test]
    fn read_registers_dependent() {
        let fx = Fixture::new();
        let reader = fx.consumer("reader");
        let state = fx.state(0);

        assert!(!state.is_dependent(&reader));
        state.read(&fx.scope(&reader)).unwrap();
        state.read(&fx.scope(&reader)).unwrap();

        assert!(state.is_dependent(&reader));
        assert_eq!(state.dependent_count(), 1);
        assert_eq!(state.get_untracked(), 0);
    }

    #[test]
    fn change_notifies_every_dependent_with_the_same_batch() {
        let fx = Fixture::new();
        let a = fx.consumer("a");
        let b = fx.consumer("b");
        let mut a_changes = a.changes();
        let mut b_changes = b.changes();
        let state = fx.state(0);
        state.read(&fx.scope(&a)).unwrap();
        state.read(&fx.scope(&b)).unwrap();

        state.set(&fx.scope(&a), 7).unwrap();

        let first = a_changes.try_recv().unwrap();
        let second = b_changes.try_recv().unwrap();
        assert_eq!(first.value.get::<i32>(), Some(7));
        assert_eq!(second.value.get::<i32>(), Some(7));
        assert!(first.batch.same_as(&fx.batch));
        assert!(second.batch.same_as(&fx.batch));

        assert!(a_changes.try_recv().is_none());
        assert!(b_changes.try_recv().is_none());
    }

    #[test]
    fn equal_value_is_stored_but_not_notified() {
        let fx = Fixture::new();
        let reader = fx.consumer("reader");
        let mut changes = reader.changes();
        let state = fx.state(vec![1, 2, 3]);
        state.read(&fx.scope(&reader)).unwrap();

        state.update(&fx.scope(&reader), |v| v.clone()).unwrap();
        state.set(&fx.scope(&reader), vec![1, 2, 3]).unwrap();

        assert!(changes.try_recv().is_none());
    }

    #[test]
    fn retired_dependents_are_not_notified() {
        let fx = Fixture::new();
        let reader = fx.consumer("reader");
        let mut changes = reader.changes();
        let state = fx.state(0);
        state.read(&fx.scope(&reader)).unwrap();

        reader.retire();
        assert_eq!(state.dependent_count(), 0);

        let writer = fx.consumer("writer");
        state.set(&fx.scope(&writer), 1).unwrap();
        assert!(changes.try_recv().is_none());

        // Reads by a retired consumer still return the value but are not tracked.
        assert_eq!(state.read(&fx.scope(&reader)).unwrap(), 1);
        assert_eq!(state.dependent_count(), 0);
    }

    #[test]
    fn state_clone_shares_state() {
        let fx = Fixture::new();
        let reader = fx.consumer("reader");
        let scope = fx.scope(&reader);
        let state1 = fx.state(0);
        let state2 = state1.clone();

        state1.set(&scope, 42).unwrap();
        assert_eq!(state2.read(&scope).unwrap(), 42);
        assert_eq!(state1.id(), state2.id());
    }

    #[test]
    fn dropping_a_state_forgets_its_edges() {
        let fx = Fixture::new();
        let reader = fx.consumer("reader");
        let state = fx.state(0);
        state.read(&fx.scope(&reader)).unwrap();
        assert_eq!(fx.registry.edge_count(), 1);

        drop(state);
        assert_eq!(fx.registry.edge_count(), 0);
    }
}
