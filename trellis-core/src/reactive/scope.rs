//! Scopes
//!
//! A [`Scope`] carries the context every tracked operation needs: the
//! consumer that reads are attributed to and the causal batch that writes
//! are tagged with. Scopes are passed explicitly, by reference, down the
//! call tree; nothing is looked up from thread-local or global state.
//!
//! Scopes are cheap to clone and are derived rather than mutated: entering
//! a query evaluation, for example, derives a scope with the query's
//! internal consumer while keeping the caller's batch.

use super::consumer::Consumer;
use crate::error::{Error, Result};
use crate::task::{Batch, SupersedeGuard};

/// The consumer, batch, and supersede guard in effect for an operation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    consumer: Option<Consumer>,
    batch: Option<Batch>,
    guard: Option<SupersedeGuard>,
}

impl Scope {
    /// An empty scope: no consumer, no batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope reading as `consumer`, with no batch.
    pub fn for_consumer(consumer: &Consumer) -> Self {
        Self::new().with_consumer(consumer)
    }

    /// Derive a scope that reads as `consumer`.
    pub fn with_consumer(&self, consumer: &Consumer) -> Self {
        Self {
            consumer: Some(consumer.clone()),
            ..self.clone()
        }
    }

    /// Derive a scope whose writes are caused by `batch`.
    pub fn with_batch(&self, batch: &Batch) -> Self {
        Self {
            batch: Some(batch.clone()),
            ..self.clone()
        }
    }

    pub(crate) fn with_guard(&self, guard: SupersedeGuard) -> Self {
        Self {
            guard: Some(guard),
            ..self.clone()
        }
    }

    pub(crate) fn without_guard(&self) -> Self {
        Self {
            guard: None,
            ..self.clone()
        }
    }

    pub fn consumer(&self) -> Option<&Consumer> {
        self.consumer.as_ref()
    }

    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    /// The consumer in scope, or `NoConsumerInScope` naming `target`.
    pub(crate) fn require_consumer(&self, target: &str) -> Result<&Consumer> {
        self.consumer.as_ref().ok_or_else(|| Error::NoConsumerInScope {
            target: target.to_string(),
        })
    }

    /// The batch in scope, or `NoBatchInScope` naming `target`.
    pub(crate) fn require_batch(&self, target: &str) -> Result<&Batch> {
        self.batch.as_ref().ok_or_else(|| Error::NoBatchInScope {
            target: target.to_string(),
        })
    }

    /// Fail with `Superseded` if this scope belongs to a single-flight run
    /// that has been replaced.
    pub(crate) fn check_guard(&self) -> Result<()> {
        match &self.guard {
            Some(guard) if guard.is_tripped() => Err(Error::Superseded {
                slot: guard.slot().to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::registry::Registry;
    use std::sync::Arc;

    #[test]
    fn empty_scope_has_nothing() {
        let scope = Scope::new();
        assert!(scope.consumer().is_none());
        assert!(scope.batch().is_none());

        assert!(matches!(
            scope.require_consumer("state"),
            Err(Error::NoConsumerInScope { target }) if target == "state"
        ));
        assert!(matches!(
            scope.require_batch("state"),
            Err(Error::NoBatchInScope { .. })
        ));
    }

    #[test]
    fn derived_scopes_keep_the_rest() {
        let registry = Arc::new(Registry::new());
        let outer = Consumer::new(&registry, "outer");
        let inner = Consumer::new(&registry, "inner");
        let batch = Batch::new("cause");

        let scope = Scope::for_consumer(&outer).with_batch(&batch);
        let nested = scope.with_consumer(&inner);

        assert_eq!(nested.consumer(), Some(&inner));
        assert!(nested.batch().is_some_and(|b| b.same_as(&batch)));

        // Deriving never mutates the original.
        assert_eq!(scope.consumer(), Some(&outer));
    }

    #[test]
    fn tripped_guard_refuses() {
        let guard = SupersedeGuard::new("search");
        let scope = Scope::new().with_guard(guard.clone());
        assert!(scope.check_guard().is_ok());

        guard.trip();
        assert!(matches!(
            scope.check_guard(),
            Err(Error::Superseded { slot }) if slot == "search"
        ));
        assert!(scope.without_guard().check_guard().is_ok());
    }
}
