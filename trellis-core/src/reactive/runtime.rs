//! Reactive Runtime
//!
//! The runtime is the root object that states, queries, commands, and
//! domains are created against. It owns:
//!
//! - the dependency registry (which consumer depends on which node),
//! - the tokio handle used to drive query forwarders,
//! - the configuration,
//! - a cache of constructed domains, keyed by domain key.
//!
//! There is no global runtime. Everything that needs one receives it
//! explicitly, so several independent runtimes can live in one process
//! (for example one per test).

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::debug;

use super::consumer::Consumer;
use super::registry::Registry;
use super::scope::Scope;
use crate::config::RuntimeConfig;
use crate::domain::{Domain, DomainBuilder};
use crate::error::{Error, Result};
use crate::task::Batch;

struct RuntimeInner {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    handle: Handle,
    /// One slot per domain key, locked while that domain is constructed.
    domains: DashMap<String, Arc<Mutex<Option<Domain>>>>,
}

/// Root of a reactive state engine.
///
/// Cloning yields another handle to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default config on the current tokio
    /// runtime.
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime on the current tokio runtime.
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| Error::NoAsyncRuntime)?;
        Ok(Self::with_handle(config, handle))
    }

    /// Create a runtime that spawns its background work on `handle`.
    pub fn with_handle(config: RuntimeConfig, handle: Handle) -> Self {
        debug!(runtime = %config.name, "runtime created");
        Self {
            inner: Arc::new(RuntimeInner {
                registry: Arc::new(Registry::with_read_tracing(config.trace_reads)),
                config,
                handle,
                domains: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Create a consumer identified by `key`.
    pub fn consumer(&self, key: impl Into<String>) -> Consumer {
        Consumer::new(&self.inner.registry, key)
    }

    /// Create a batch whose tasks run on this runtime's tokio handle.
    pub fn batch(&self, name: impl Into<String>) -> Batch {
        Batch::with_handle(name, self.inner.handle.clone())
    }

    /// Run `f` under a fresh consumer, retiring it afterwards.
    pub fn consume<T>(&self, key: impl Into<String>, f: impl FnOnce(&Scope) -> T) -> T {
        let consumer = self.consumer(key);
        let result = f(&Scope::for_consumer(&consumer));
        consumer.retire();
        result
    }

    /// Async form of [`Runtime::consume`].
    pub async fn consume_async<F, Fut, T>(&self, key: impl Into<String>, f: F) -> T
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = T>,
    {
        let consumer = self.consumer(key);
        let result = f(Scope::for_consumer(&consumer)).await;
        consumer.retire();
        result
    }

    /// Construct the domain `key`, or return the one already constructed
    /// on this runtime under that key. `constructor` only runs on a miss.
    ///
    /// Concurrent callers for the same key wait for the first construction
    /// instead of running their own. A constructor may look up other
    /// domains, but must not ask for its own key.
    pub fn domain<F>(&self, key: &str, constructor: F) -> Result<Domain>
    where
        F: FnOnce(&mut DomainBuilder) -> Result<()>,
    {
        // The map shard is released before construction starts.
        let slot = self
            .inner
            .domains
            .entry(key.to_string())
            .or_default()
            .clone();
        let mut slot = slot.lock();
        if let Some(domain) = slot.as_ref() {
            return Ok(domain.clone());
        }
        let domain = Domain::make(self, key, constructor)?;
        *slot = Some(domain.clone());
        Ok(domain)
    }

    /// A previously constructed domain, if any.
    pub fn cached_domain(&self, key: &str) -> Option<Domain> {
        let slot = self.inner.domains.get(key)?.clone();
        let domain = slot.lock().clone();
        domain
    }

    /// Number of live, non-retired consumers.
    pub fn consumer_count(&self) -> usize {
        self.inner.registry.consumer_count()
    }

    /// Total number of dependency and subscription edges.
    pub fn edge_count(&self) -> usize {
        self.inner.registry.edge_count()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.inner.config.name)
            .field("consumers", &self.consumer_count())
            .field("edges", &self.edge_count())
            .field("domains", &self.inner.domains.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::State;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn runtime_requires_tokio() {
        assert!(matches!(Runtime::new(), Err(Error::NoAsyncRuntime)));
    }

    #[test]
    fn runtime_accepts_an_explicit_handle() {
        let tokio = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let runtime = Runtime::with_handle(RuntimeConfig::default(), tokio.handle().clone());
        assert_eq!(runtime.config().name, "trellis");
    }

    #[tokio::test]
    async fn runtime_registers_and_unregisters_consumers() {
        let runtime = Runtime::new().unwrap();
        let consumer = runtime.consumer("reader");
        assert_eq!(runtime.consumer_count(), 1);

        drop(consumer);
        assert_eq!(runtime.consumer_count(), 0);
    }

    #[tokio::test]
    async fn consume_retires_its_consumer() {
        let runtime = Runtime::new().unwrap();
        let state = State::new(&runtime, 4);

        let value = runtime.consume("test", |scope| state.read(scope)).unwrap();

        assert_eq!(value, 4);
        assert_eq!(state.dependent_count(), 0);
        assert_eq!(runtime.consumer_count(), 0);
    }

    #[tokio::test]
    async fn consume_async_retires_its_consumer() {
        let runtime = Runtime::new().unwrap();
        let state = State::new(&runtime, 4);
        let source = state.clone();

        let value = runtime
            .consume_async("test", |scope| async move {
                tokio::task::yield_now().await;
                let value = source.read(&scope)?;
                assert_eq!(source.dependent_count(), 1);
                Ok::<_, Error>(value)
            })
            .await
            .unwrap();

        assert_eq!(value, 4);
        assert_eq!(state.dependent_count(), 0);
    }

    #[test]
    fn concurrent_domain_lookups_construct_once() {
        let tokio = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let runtime = Runtime::with_handle(RuntimeConfig::default(), tokio.handle().clone());
        let builds = AtomicUsize::new(0);
        let barrier = Barrier::new(4);

        let domains: Vec<Domain> = std::thread::scope(|threads| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    threads.spawn(|| {
                        barrier.wait();
                        runtime
                            .domain("shared", |d| {
                                builds.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(Duration::from_millis(20));
                                d.named_state("count", 0);
                                Ok(())
                            })
                            .unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(domains.len(), 4);
        assert!(domains.iter().all(|domain| domain.key() == "shared"));
        assert!(runtime.cached_domain("shared").is_some());
    }

    #[tokio::test]
    async fn failed_construction_is_retried() {
        let runtime = Runtime::new().unwrap();

        let err = runtime
            .domain("flaky", |_| Err(Error::msg("not yet")))
            .unwrap_err();
        assert_eq!(err.to_string(), "not yet");
        assert!(runtime.cached_domain("flaky").is_none());

        assert!(runtime.domain("flaky", |_| Ok(())).is_ok());
        assert!(runtime.cached_domain("flaky").is_some());
    }

    #[tokio::test]
    async fn batches_carry_the_runtime_handle() {
        let runtime = Runtime::new().unwrap();
        let batch = runtime.batch("ui");

        let task = std::thread::scope(|threads| {
            threads
                .spawn(|| batch.spawn(async { Ok(()) }))
                .join()
                .unwrap()
        });

        assert!(task.wait().await.is_completed());
    }
}
