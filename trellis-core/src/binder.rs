//! Binder Surface
//!
//! The pieces a UI binder needs to drive the engine without knowing how it
//! works: a [`Getter`] to read queries as a fixed consumer, a
//! [`Dispatcher`] to run commands under a fresh batch and await their
//! settlement, and a naming-only [`Component`] tree that hands each node
//! its own consumer.
//!
//! Rendering, mounting and suspension are the binder's business. This
//! module only guarantees that a component's reads are attributed to the
//! component and that every dispatch can be joined or cancelled as a unit.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info_span, Span};

use crate::error::Result;
use crate::reactive::{Command, Consumer, Query, Runtime, Scope};
use crate::task::{Batch, Task, TaskOutcome};

/// Reads queries on behalf of one consumer.
#[derive(Debug, Clone)]
pub struct Getter {
    scope: Scope,
}

impl Getter {
    pub fn new(consumer: &Consumer) -> Self {
        Self {
            scope: Scope::for_consumer(consumer),
        }
    }

    /// Evaluate `query`, subscribing this getter's consumer to it.
    pub fn get<V>(&self, query: &Query<V>) -> Result<V>
    where
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        query.read(&self.scope)
    }
}

/// Runs commands, each under a batch of its own.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    runtime: Runtime,
    consumer: Consumer,
}

impl Dispatcher {
    pub fn new(runtime: &Runtime, consumer: &Consumer) -> Self {
        Self {
            runtime: runtime.clone(),
            consumer: consumer.clone(),
        }
    }

    /// Spawn `command` into a fresh batch and return immediately.
    pub fn dispatch<A>(&self, command: &Command<A>, args: A) -> Dispatch
    where
        A: Send + 'static,
    {
        let batch = self.runtime.batch(self.runtime.config().dispatch_batch.clone());
        let scope = Scope::for_consumer(&self.consumer).with_batch(&batch);
        let command = command.clone();

        debug!(command = %command.key(), batch = %batch.name(), "dispatch");
        let task = batch.spawn(async move { command.invoke(&scope, args).await });

        Dispatch { batch, task }
    }
}

/// One in-flight dispatch.
#[derive(Debug, Clone)]
pub struct Dispatch {
    batch: Batch,
    task: Task,
}

impl Dispatch {
    /// The batch every write of this dispatch is tagged with.
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Wait for the command, then for everything spawned into its batch.
    /// Returns the command's own outcome.
    pub async fn settled(&self) -> TaskOutcome {
        let outcome = self.task.wait().await;
        self.batch.join().await;
        outcome
    }

    pub fn cancel(&self) {
        self.batch.cancel();
    }
}

struct ComponentInner {
    name: String,
    runtime: Runtime,
    consumer: Consumer,
    span: Span,
    children: Mutex<Vec<String>>,
}

/// A node of the binder's component tree.
///
/// Each node owns the consumer `component:<name>`; it is retired when the
/// last handle to the node is dropped.
#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

impl Component {
    pub fn root(runtime: &Runtime) -> Self {
        Self::named(runtime, "root")
    }

    fn named(runtime: &Runtime, name: &str) -> Self {
        let span = info_span!("component", name = %name);
        span.in_scope(|| debug!(component = %name, "component created"));
        Self {
            inner: Arc::new(ComponentInner {
                name: name.to_string(),
                runtime: runtime.clone(),
                consumer: runtime.consumer(format!("component:{name}")),
                span,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn child(&self, name: &str) -> Self {
        self.inner.children.lock().push(name.to_string());
        Self::named(&self.inner.runtime, name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn consumer(&self) -> &Consumer {
        &self.inner.consumer
    }

    /// The `component` span this node was created under. Binders enter it
    /// around work done on the node's behalf.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Names of the children created so far, in creation order.
    pub fn children(&self) -> Vec<String> {
        self.inner.children.lock().clone()
    }

    pub fn scope(&self) -> Scope {
        Scope::for_consumer(&self.inner.consumer)
    }

    pub fn getter(&self) -> Getter {
        Getter::new(&self.inner.consumer)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(&self.inner.runtime, &self.inner.consumer)
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.inner.name)
            .field("consumer", &self.inner.consumer.key())
            .field("children", &*self.inner.children.lock())
            .finish()
    }
}
