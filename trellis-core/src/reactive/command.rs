//! Command Implementation
//!
//! A Command is a named mutation. Its body is an async function of a scope
//! and an argument; every invocation runs under the command's own consumer
//! and the caller's causal batch, inside a `command` span.
//!
//! # Differences from Query
//!
//! - Queries return a value; commands only have effects.
//! - Queries are synchronous; command bodies may suspend (delays, joins).
//! - Queries need a consumer in scope; commands need a batch, because every
//!   write they make must be attributable to a cause.
//!
//! Failures are not swallowed: the body's error is returned to the invoker
//! as `CommandFailed`, with the original error as its source. Writes the
//! body committed before failing stay committed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{info_span, Instrument};

use super::consumer::Consumer;
use super::registry::Registry;
use super::runtime::Runtime;
use super::scope::Scope;
use crate::error::{Error, Result};

type Body<A> = dyn Fn(Scope, A) -> BoxFuture<'static, Result<()>> + Send + Sync;

struct CommandInner<A> {
    key: String,
    consumer: Consumer,
    body: Box<Body<A>>,
}

/// A named, causally tagged mutation taking arguments of type `A`.
///
/// # Example
///
/// ```rust,ignore
/// let target = count.clone();
/// let incr = Command::new(&runtime, "incr", move |scope, by: i32| {
///     let target = target.clone();
///     async move { target.update(&scope, |v| v + by) }
/// });
///
/// incr.invoke(&scope, 1).await?;
/// ```
pub struct Command<A> {
    inner: Arc<CommandInner<A>>,
}

impl<A> Command<A>
where
    A: Send + 'static,
{
    pub fn new<F, Fut>(runtime: &Runtime, key: impl Into<String>, body: F) -> Self
    where
        F: Fn(Scope, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::with_registry(runtime.registry(), key.into(), boxed(body))
    }

    pub(crate) fn with_registry(registry: &Arc<Registry>, key: String, body: Box<Body<A>>) -> Self {
        let consumer = Consumer::new(registry, format!("command:{key}"));
        Self {
            inner: Arc::new(CommandInner {
                key,
                consumer,
                body,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The consumer every invocation reads as.
    pub fn consumer(&self) -> &Consumer {
        &self.inner.consumer
    }

    /// Run the body once under the scope's batch.
    ///
    /// Fails with `NoBatchInScope` before running anything if the scope
    /// has no batch.
    pub async fn invoke(&self, scope: &Scope, args: A) -> Result<()> {
        let batch = scope.require_batch(&self.inner.key)?;
        let span = info_span!("command", key = %self.inner.key, batch = %batch.name());
        let scope = scope.with_consumer(&self.inner.consumer);

        (self.inner.body)(scope, args)
            .instrument(span)
            .await
            .map_err(|source| Error::CommandFailed {
                key: self.inner.key.clone(),
                source: Box::new(source),
            })
    }
}

/// Erase a command body's future type.
pub(crate) fn boxed<A, F, Fut>(body: F) -> Box<Body<A>>
where
    A: 'static,
    F: Fn(Scope, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |scope: Scope, args: A| body(scope, args).boxed())
}

impl<A> Clone for Command<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for Command<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("key", &self.inner.key)
            .field("consumer", &self.inner.consumer.key())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
