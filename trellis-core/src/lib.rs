//! Trellis Core
//!
//! This crate provides the core of the Trellis reactive state engine.
//! It implements:
//!
//! - Reactive primitives (states, queries, commands) with dynamic
//!   dependency tracking and equality-gated change propagation
//! - Causal batches: joinable, cancellable groups of tasks attributable to
//!   one dispatch
//! - Single-flight execution that supersedes in-flight work
//! - Domains: named, frozen sets of queries and commands
//! - A binder surface for UI layers (getters, dispatchers, components)
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: the runtime, consumers, change channels and primitives
//! - `task`: causal batches and single-flight execution
//! - `domain`: domain construction and typed lookup
//! - `binder`: the interfaces exposed to an external UI binder
//! - `config`: runtime configuration
//! - `error`: the crate error type
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{Batch, Runtime, Scope};
//!
//! let runtime = Runtime::new()?;
//!
//! let counter = runtime.domain("counter", |d| {
//!     let count = d.state(0);
//!     let source = count.clone();
//!     d.query("doubled", move |scope| Ok(source.read(scope)? * 2))?;
//!     d.command("set", move |scope, value: i32| {
//!         let count = count.clone();
//!         async move { count.set(&scope, value) }
//!     })
//! })?;
//!
//! let view = runtime.consumer("view");
//! let scope = Scope::for_consumer(&view).with_batch(&Batch::new("ui"));
//!
//! assert_eq!(counter.read::<i32>("doubled", &scope)?, 0);
//! counter.invoke("set", &scope, 5).await?;
//!
//! // The view is notified with the recomputed value.
//! let change = view.changes().recv().await;
//! ```

pub mod binder;
pub mod config;
pub mod domain;
pub mod error;
pub mod reactive;
pub mod task;

pub use binder::{Component, Dispatch, Dispatcher, Getter};
pub use config::RuntimeConfig;
pub use domain::{Domain, DomainBuilder};
pub use error::{Error, Result};
pub use reactive::{
    Change, ChangeValue, Changes, Command, Consumer, ConsumerId, NodeId, Query, Runtime, Scope,
    State, Subscription,
};
pub use task::{Batch, SingleFlight, Task, TaskId, TaskOutcome};
