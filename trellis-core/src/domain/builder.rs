//! Domain construction.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::reactive::{Command, Consumer, Query, Runtime, Scope, State};
use crate::task::SingleFlight;

pub(crate) type Handle = Arc<dyn Any + Send + Sync>;
type Pending = Box<dyn FnOnce(&Runtime) -> Handle>;

/// The domain under construction.
///
/// A constructor uses the builder to allocate states and single-flight
/// helpers, to read and write them through [`DomainBuilder::scope`], and to
/// register the queries and commands the domain exposes. Registered entries
/// only become callable once construction has finished.
pub struct DomainBuilder<'rt> {
    runtime: &'rt Runtime,
    key: String,
    setup_consumer: Consumer,
    setup: Scope,
    queries: IndexMap<String, Pending>,
    commands: IndexMap<String, Pending>,
}

impl<'rt> DomainBuilder<'rt> {
    pub(crate) fn new(runtime: &'rt Runtime, key: &str) -> Self {
        let setup_consumer = runtime.consumer(format!("domain:{key}"));
        let setup = Scope::for_consumer(&setup_consumer).with_batch(&runtime.batch(format!("setup:{key}")));
        Self {
            runtime,
            key: key.to_string(),
            setup_consumer,
            setup,
            queries: IndexMap::new(),
            commands: IndexMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn runtime(&self) -> &Runtime {
        self.runtime
    }

    /// Scope for reads and writes made while setting the domain up.
    pub fn scope(&self) -> &Scope {
        &self.setup
    }

    /// Allocate a state owned by this domain.
    pub fn state<V>(&self, initial: V) -> State<V>
    where
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        State::new(self.runtime, initial)
    }

    /// Allocate a state with a readable label (`<domain>.<name>`).
    pub fn named_state<V>(&self, name: &str, initial: V) -> State<V>
    where
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        State::named(self.runtime, format!("{}.{name}", self.key), initial)
    }

    /// Allocate a single-flight executor owned by this domain.
    pub fn single_flight(&self, name: &str) -> SingleFlight {
        SingleFlight::new(self.runtime, format!("{}.{name}", self.key))
    }

    /// Register a query under `name`.
    pub fn query<V, F>(&mut self, name: &str, expr: F) -> Result<()>
    where
        V: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&Scope) -> Result<V> + Send + Sync + 'static,
    {
        if self.queries.contains_key(name) {
            return Err(self.duplicate(name));
        }
        let key = name.to_string();
        self.queries.insert(
            key.clone(),
            Box::new(move |runtime: &Runtime| -> Handle { Arc::new(Query::new(runtime, key, expr)) }),
        );
        Ok(())
    }

    /// Register a command under `name`.
    pub fn command<A, F, Fut>(&mut self, name: &str, body: F) -> Result<()>
    where
        A: Send + 'static,
        F: Fn(Scope, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.commands.contains_key(name) {
            return Err(self.duplicate(name));
        }
        let key = name.to_string();
        self.commands.insert(
            key.clone(),
            Box::new(move |runtime: &Runtime| -> Handle { Arc::new(Command::new(runtime, key, body)) }),
        );
        Ok(())
    }

    fn duplicate(&self, name: &str) -> Error {
        Error::DuplicateEntry {
            domain: self.key.clone(),
            name: name.to_string(),
        }
    }

    /// Wrap every registered entry and retire the setup consumer.
    pub(crate) fn finish(self) -> (String, IndexMap<String, Handle>, IndexMap<String, Handle>) {
        let runtime = self.runtime;
        let queries = self
            .queries
            .into_iter()
            .map(|(name, build)| (name, build(runtime)))
            .collect();
        let commands = self
            .commands
            .into_iter()
            .map(|(name, build)| (name, build(runtime)))
            .collect();
        self.setup_consumer.retire();
        (self.key, queries, commands)
    }
}
