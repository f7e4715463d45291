//! Domains
//!
//! A [`Domain`] is the unit of composition: a named set of queries and
//! commands built once by a constructor. The constructor receives a
//! [`DomainBuilder`] through which it allocates states and helpers, may
//! read and write them during setup, and registers the domain's entries.
//!
//! Once the constructor returns, every registered query and command is
//! wrapped, and the domain's surface is frozen: the set of names never
//! changes and each entry is a stable handle for the domain's lifetime.
//!
//! # Example
//!
//! ```rust,ignore
//! let counter = Domain::make(&runtime, "counter", |d| {
//!     let count = d.state(0);
//!
//!     let source = count.clone();
//!     d.query("count", move |scope| Ok(source.read(scope)? * 2))?;
//!
//!     d.command("incr", move |scope, by: i32| {
//!         let count = count.clone();
//!         async move { count.update(&scope, |v| v + by) }
//!     })
//! })?;
//!
//! counter.command::<i32>("incr")?.invoke(&scope, 1).await?;
//! ```

mod builder;

pub use builder::DomainBuilder;

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use builder::Handle;
use crate::error::{Error, Result};
use crate::reactive::{Command, Query, Runtime, Scope};

struct DomainInner {
    key: String,
    queries: IndexMap<String, Handle>,
    commands: IndexMap<String, Handle>,
}

/// A named, frozen set of queries and commands.
#[derive(Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

impl Domain {
    /// Run `constructor` once and freeze the resulting domain.
    ///
    /// Use [`Runtime::domain`] to share one instance per key.
    pub fn make<F>(runtime: &Runtime, key: &str, constructor: F) -> Result<Self>
    where
        F: FnOnce(&mut DomainBuilder) -> Result<()>,
    {
        let mut builder = DomainBuilder::new(runtime, key);
        constructor(&mut builder)?;
        let (key, queries, commands) = builder.finish();

        debug!(
            domain = %key,
            queries = queries.len(),
            commands = commands.len(),
            "domain constructed"
        );
        Ok(Self {
            inner: Arc::new(DomainInner {
                key,
                queries,
                commands,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Handle to the query `name` producing values of type `V`.
    pub fn query<V>(&self, name: &str) -> Result<Query<V>>
    where
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        let handle = self.inner.queries.get(name).ok_or_else(|| Error::UnknownQuery {
            domain: self.inner.key.clone(),
            name: name.to_string(),
        })?;
        handle
            .downcast_ref::<Query<V>>()
            .cloned()
            .ok_or_else(|| self.mismatch::<Query<V>>(name))
    }

    /// Handle to the command `name` taking arguments of type `A`.
    pub fn command<A>(&self, name: &str) -> Result<Command<A>>
    where
        A: Send + 'static,
    {
        let handle = self.inner.commands.get(name).ok_or_else(|| Error::UnknownCommand {
            domain: self.inner.key.clone(),
            name: name.to_string(),
        })?;
        handle
            .downcast_ref::<Command<A>>()
            .cloned()
            .ok_or_else(|| self.mismatch::<Command<A>>(name))
    }

    /// Read the query `name` under `scope`.
    pub fn read<V>(&self, name: &str, scope: &Scope) -> Result<V>
    where
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        self.query::<V>(name)?.read(scope)
    }

    /// Invoke the command `name` under `scope`.
    pub async fn invoke<A>(&self, name: &str, scope: &Scope, args: A) -> Result<()>
    where
        A: Send + 'static,
    {
        self.command::<A>(name)?.invoke(scope, args).await
    }

    pub fn query_names(&self) -> impl Iterator<Item = &str> {
        self.inner.queries.keys().map(String::as_str)
    }

    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.inner.commands.keys().map(String::as_str)
    }

    fn mismatch<T>(&self, name: &str) -> Error {
        Error::HandleTypeMismatch {
            domain: self.inner.key.clone(),
            name: name.to_string(),
            expected: type_name::<T>(),
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("key", &self.inner.key)
            .field("queries", &self.inner.queries.keys().collect::<Vec<_>>())
            .field("commands", &self.inner.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}
