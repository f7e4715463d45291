//! Dependency Registry
//!
//! The registry is the index that connects reactive nodes (states and
//! queries) to the consumers that read them. Nodes never hold consumers
//! directly: they hold a [`NodeId`], and the registry maps each node to an
//! insertion-ordered set of [`ConsumerId`]s. Consumers themselves are kept
//! as weak references, so a node never keeps a reader alive.
//!
//! # How It Works
//!
//! 1. A consumer registers itself when it is created.
//!
//! 2. A tracked read records an edge `node -> consumer`.
//!
//! 3. A change on a node snapshots its dependents, upgrading the weak
//!    references, and the caller notifies them outside of any lock.
//!
//! 4. Retiring a consumer removes it from every edge set. Edges are never
//!    pruned any other way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use dashmap::DashMap;
use indexmap::IndexSet;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::consumer::{Consumer, ConsumerId, ConsumerInner};

/// Identifier of a reactive node (a state or a query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Snapshot of a node's dependents, taken for one fan-out pass.
pub(crate) type Dependents = SmallVec<[Consumer; 4]>;

/// Index of live consumers and dependency edges.
pub(crate) struct Registry {
    consumers: DashMap<ConsumerId, Weak<ConsumerInner>>,
    edges: RwLock<HashMap<NodeId, IndexSet<ConsumerId>>>,
    trace_reads: bool,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::with_read_tracing(false)
    }

    pub(crate) fn with_read_tracing(trace_reads: bool) -> Self {
        Self {
            consumers: DashMap::new(),
            edges: RwLock::new(HashMap::new()),
            trace_reads,
        }
    }

    /// Whether tracked reads should emit `trace!` events.
    pub(crate) fn traces_reads(&self) -> bool {
        self.trace_reads
    }

    pub(crate) fn register(&self, id: ConsumerId, consumer: Weak<ConsumerInner>) {
        self.consumers.insert(id, consumer);
    }

    /// Record that `consumer` depends on `node`.
    ///
    /// Returns `false` without recording anything if the consumer has
    /// already been retired.
    pub(crate) fn add_dependency(&self, node: NodeId, consumer: &Consumer) -> bool {
        let mut edges = self.edges.write();
        // Checked under the edge lock so a concurrent retirement either sees
        // this edge or prevents it.
        if consumer.is_retired() {
            return false;
        }
        edges.entry(node).or_default().insert(consumer.id());
        true
    }

    /// Remove one edge. Returns whether it existed.
    pub(crate) fn remove_dependency(&self, node: NodeId, consumer: ConsumerId) -> bool {
        let mut edges = self.edges.write();
        let Some(set) = edges.get_mut(&node) else {
            return false;
        };
        let removed = set.shift_remove(&consumer);
        if set.is_empty() {
            edges.remove(&node);
        }
        removed
    }

    /// Remove a consumer from every edge set and from the live table.
    pub(crate) fn retire(&self, consumer: ConsumerId) {
        self.consumers.remove(&consumer);

        let mut edges = self.edges.write();
        edges.retain(|_, set| {
            set.shift_remove(&consumer);
            !set.is_empty()
        });
    }

    /// Drop every edge of a node that no longer exists.
    pub(crate) fn forget_node(&self, node: NodeId) {
        self.edges.write().remove(&node);
    }

    /// Live dependents of `node`, in the order they first read it.
    pub(crate) fn dependents(&self, node: NodeId) -> Dependents {
        let ids: SmallVec<[ConsumerId; 4]> = match self.edges.read().get(&node) {
            Some(set) => set.iter().copied().collect(),
            None => return Dependents::new(),
        };

        ids.into_iter()
            .filter_map(|id| {
                self.consumers
                    .get(&id)
                    .and_then(|weak| weak.upgrade())
                    .map(Consumer::from_inner)
            })
            .collect()
    }

    pub(crate) fn is_dependent(&self, node: NodeId, consumer: ConsumerId) -> bool {
        self.edges
            .read()
            .get(&node)
            .is_some_and(|set| set.contains(&consumer))
    }

    pub(crate) fn dependent_count(&self, node: NodeId) -> usize {
        self.edges.read().get(&node).map_or(0, IndexSet::len)
    }

    /// Number of consumers that are registered and not retired.
    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Total number of dependency edges across all nodes.
    pub(crate) fn edge_count(&self) -> usize {
        self.edges.read().values().map(IndexSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new())
    }

    #[test]
    fn node_ids_are_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
        assert!(a.raw() < b.raw());
    }

    #[test]
    fn registry_tracks_consumers() {
        let registry = registry();
        let consumer = Consumer::new(&registry, "reader");
        assert_eq!(registry.consumer_count(), 1);

        drop(consumer);
        assert_eq!(registry.consumer_count(), 0);
    }

    #[test]
    fn dependents_keep_insertion_order() {
        let registry = registry();
        let node = NodeId::new();
        let first = Consumer::new(&registry, "first");
        let second = Consumer::new(&registry, "second");
        let third = Consumer::new(&registry, "third");

        registry.add_dependency(node, &second);
        registry.add_dependency(node, &first);
        registry.add_dependency(node, &third);
        registry.add_dependency(node, &second);

        let keys: Vec<String> = registry
            .dependents(node)
            .iter()
            .map(|c| c.key().to_string())
            .collect();
        assert_eq!(keys, vec!["second", "first", "third"]);
    }

    #[test]
    fn retirement_clears_every_edge() {
        let registry = registry();
        let a = NodeId::new();
        let b = NodeId::new();
        let consumer = Consumer::new(&registry, "reader");
        let other = Consumer::new(&registry, "other");

        registry.add_dependency(a, &consumer);
        registry.add_dependency(b, &consumer);
        registry.add_dependency(b, &other);
        assert_eq!(registry.edge_count(), 3);

        consumer.retire();

        assert_eq!(registry.edge_count(), 1);
        assert!(!registry.is_dependent(a, consumer.id()));
        assert!(registry.is_dependent(b, other.id()));
    }

    #[test]
    fn retired_consumers_cannot_gain_edges() {
        let registry = registry();
        let node = NodeId::new();
        let consumer = Consumer::new(&registry, "reader");
        consumer.retire();

        assert!(!registry.add_dependency(node, &consumer));
        assert_eq!(registry.dependent_count(node), 0);
    }

    #[test]
    fn remove_dependency_drops_a_single_edge() {
        let registry = registry();
        let node = NodeId::new();
        let consumer = Consumer::new(&registry, "reader");

        registry.add_dependency(node, &consumer);
        assert!(registry.remove_dependency(node, consumer.id()));
        assert!(!registry.remove_dependency(node, consumer.id()));
        assert_eq!(registry.edge_count(), 0);
    }
}
