//! Reactive Primitives
//!
//! This module implements the core reactive system: states, queries, and
//! commands, all created against an explicit [`Runtime`].
//!
//! # Concepts
//!
//! ## States
//!
//! A State is a container for a mutable value. Reading it under a scope
//! registers the scope's consumer as a dependent. Writing a value that
//! differs from the current one notifies every dependent, tagged with the
//! writer's batch.
//!
//! ## Queries
//!
//! A Query is a named derived value. Its expression is evaluated on every
//! read and again whenever an upstream state or query changes, at which
//! point the recomputed value is pushed to every subscriber.
//!
//! ## Commands
//!
//! A Command is a named async mutation. It runs under its own consumer and
//! the caller's batch, so every write it makes carries the caller's cause.
//!
//! # Implementation Notes
//!
//! There is no ambient tracking context. The consumer and batch a read or
//! write happens under travel in an explicit [`Scope`], and dependency edges
//! live in a registry owned by the runtime. Edges are only removed when a
//! consumer is retired or explicitly unsubscribed.

mod channel;
mod command;
mod consumer;
mod query;
mod registry;
mod runtime;
mod scope;
mod state;

pub use channel::{Change, ChangeValue, Changes};
pub use command::Command;
pub use consumer::{Consumer, ConsumerId};
pub use query::{Query, Subscription};
pub use registry::NodeId;
pub use runtime::Runtime;
pub use scope::Scope;
pub use state::State;

pub(crate) use registry::Registry;
