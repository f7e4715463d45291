//! Tasks and Causal Batches
//!
//! Everything asynchronous in the engine runs as a tokio task owned by a
//! [`Batch`]. Batches record *why* work is happening: the command dispatch
//! or mount that caused it. Single-flight slots build cancel-superseding
//! executors on top of batches.

mod batch;
mod single_flight;

pub use batch::{Batch, Task, TaskId, TaskOutcome};
pub use single_flight::SingleFlight;
pub(crate) use single_flight::SupersedeGuard;
