//! Causal Batches
//!
//! A [`Batch`] (a "trigger") is the named bag of tasks caused by one
//! dispatch or mount. Every write made on behalf of that cause is tagged
//! with the batch, so whoever observes the change can register follow-up
//! work on it, and whoever caused the change can [`Batch::join`] and wait for
//! everything to settle.
//!
//! # Cancellation
//!
//! Every task owns a child batch. Cancelling a task aborts it and cancels
//! its child batch, which cancels every task spawned there, transitively.
//! Tasks spawned into an already cancelled batch are cancelled immediately.
//!
//! # Retention
//!
//! A batch keeps every task handle, finished or not, until it is joined.
//! Long-lived batches that are never joined grow by one handle per spawn.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How a task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed,
    Failed(Arc<Error>),
    Cancelled,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct TaskInner {
    id: TaskId,
    abort: Option<AbortHandle>,
    outcome: watch::Receiver<Option<TaskOutcome>>,
    children: Batch,
}

/// Handle to one cancellable unit of work spawned into a batch.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Cancel the task and everything spawned into its child batch.
    ///
    /// Best effort: the task stops at its next suspension point.
    pub fn cancel(&self) {
        if let Some(abort) = &self.inner.abort {
            abort.abort();
        }
        self.inner.children.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// The outcome, if the task has ended.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.inner.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome
            .or_else(|| self.outcome())
            .unwrap_or(TaskOutcome::Cancelled)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Publishes a task's outcome. Dropped without an outcome (the future was
/// aborted before finishing) means the task was cancelled.
struct OutcomeReporter {
    tx: watch::Sender<Option<TaskOutcome>>,
}

impl OutcomeReporter {
    fn finish(&self, outcome: TaskOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for OutcomeReporter {
    fn drop(&mut self) {
        self.tx.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(TaskOutcome::Cancelled);
                true
            } else {
                false
            }
        });
    }
}

struct BatchInner {
    name: String,
    handle: Option<Handle>,
    tasks: Mutex<Vec<Task>>,
    cancelled: AtomicBool,
}

/// A named, joinable, cancellable set of tasks attributable to one cause.
///
/// Cloning yields another handle to the same batch.
#[derive(Clone)]
pub struct Batch {
    inner: Arc<BatchInner>,
}

impl Batch {
    /// Create a batch that spawns on the tokio runtime current at this
    /// call, if any. Prefer [`Runtime::batch`](crate::reactive::Runtime::batch),
    /// which always carries the runtime's handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), Handle::try_current().ok())
    }

    /// Create a batch whose tasks are spawned on `handle`.
    pub fn with_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self::build(name.into(), Some(handle))
    }

    fn build(name: String, handle: Option<Handle>) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                name,
                handle,
                tasks: Mutex::new(Vec::new()),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether both handles refer to the same batch.
    pub fn same_as(&self, other: &Batch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Spawn `fut` as an independent task and append it to the batch.
    ///
    /// Without a handle or a current tokio runtime the task is not started
    /// and ends as `Failed(NoAsyncRuntime)`.
    pub fn spawn<Fut>(&self, fut: Fut) -> Task
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_with(move |_| fut)
    }

    /// Like [`Batch::spawn`], handing the task its child batch. Work spawned
    /// into the child batch is cancelled together with the task.
    pub fn spawn_with<F, Fut>(&self, f: F) -> Task
    where
        F: FnOnce(Batch) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = TaskId::new();
        let handle = self
            .inner
            .handle
            .clone()
            .or_else(|| Handle::try_current().ok());
        let children = Batch::build(format!("{}/{}", self.inner.name, id.0), handle.clone());
        let (tx, rx) = watch::channel(None);
        let reporter = OutcomeReporter { tx };
        let batch = self.inner.name.clone();
        let fut = f(children.clone());

        // No lock is held here: a runtime that is shutting down drops the
        // future, and with it any drop guards, on this thread.
        let abort = match handle {
            Some(handle) => {
                let join = handle.spawn(async move {
                    match fut.await {
                        Ok(()) => reporter.finish(TaskOutcome::Completed),
                        Err(err) => {
                            warn!(batch = %batch, error = %err, "batch task failed");
                            reporter.finish(TaskOutcome::Failed(Arc::new(err)));
                        }
                    }
                });
                Some(join.abort_handle())
            }
            None => {
                drop(fut);
                warn!(batch = %batch, "no tokio runtime to spawn batch task on");
                reporter.finish(TaskOutcome::Failed(Arc::new(Error::NoAsyncRuntime)));
                None
            }
        };

        let task = Task {
            inner: Arc::new(TaskInner {
                id,
                abort,
                outcome: rx,
                children,
            }),
        };

        // Checked under the task list lock, which `cancel` also holds while
        // raising the flag: either `cancel` sees this task or we see the flag.
        let cancelled = {
            let mut tasks = self.inner.tasks.lock();
            tasks.push(task.clone());
            self.inner.cancelled.load(Ordering::SeqCst)
        };
        if cancelled {
            task.cancel();
        }
        task
    }

    /// Wait until every task in the batch has reached a terminal state.
    ///
    /// The task list is drained and awaited repeatedly until it is observed
    /// empty, so tasks appended while joining are awaited too. The batch is
    /// empty and reusable afterwards. Returns the drained tasks' outcomes in
    /// spawn order.
    pub async fn join(&self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let pending = std::mem::take(&mut *self.inner.tasks.lock());
            if pending.is_empty() {
                break;
            }
            for task in pending {
                outcomes.push(task.wait().await);
            }
        }
        outcomes
    }

    /// Cancel every current task. Tasks spawned afterwards are cancelled
    /// as soon as they are spawned.
    pub fn cancel(&self) {
        let tasks = {
            let tasks = self.inner.tasks.lock();
            self.inner.cancelled.store(true, Ordering::SeqCst);
            tasks.clone()
        };
        if !tasks.is_empty() {
            debug!(batch = %self.inner.name, tasks = tasks.len(), "cancelling batch");
        }
        for task in tasks {
            task.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Number of tasks not yet drained by a join.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("name", &self.inner.name)
            .field("tasks", &self.task_count())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn join_waits_for_every_task() {
        let batch = Batch::new("test");
        let done = Arc::new(AtomicI32::new(0));

        for delay in [30, 10, 20] {
            let done = done.clone();
            batch.spawn(async move {
                sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let outcomes = batch.join().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(TaskOutcome::is_completed));
        assert_eq!(batch.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_reusable_after_join() {
        let batch = Batch::new("test");
        batch.spawn(async { Ok(()) });
        batch.join().await;

        batch.spawn(async {
            sleep(Duration::from_millis(5)).await;
            Ok(())
        });
        let outcomes = batch.join().await;
        assert_eq!(outcomes.len(), 1);

        // Joining an empty batch returns immediately.
        assert!(batch.join().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn join_includes_tasks_added_while_joining() {
        let batch = Batch::new("test");
        let late = Arc::new(AtomicBool::new(false));

        let spawner = batch.clone();
        let flag = late.clone();
        batch.spawn(async move {
            sleep(Duration::from_millis(10)).await;
            spawner.spawn(async move {
                sleep(Duration::from_millis(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        let outcomes = batch.join().await;
        assert_eq!(outcomes.len(), 2);
        assert!(late.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failures_are_terminal_outcomes() {
        let batch = Batch::new("test");
        let task = batch.spawn(async { Err::<(), _>(Error::msg("boom")) });

        match task.wait().await {
            TaskOutcome::Failed(err) => assert_eq!(err.to_string(), "boom"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_propagates_to_children() {
        let batch = Batch::new("test");
        let child_ran = Arc::new(AtomicBool::new(false));

        let flag = child_ran.clone();
        let parent = batch.spawn_with(move |children| {
            let child = children.spawn(async move {
                sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            async move {
                child.wait().await;
                Ok(())
            }
        });

        sleep(Duration::from_millis(10)).await;
        parent.cancel();

        assert!(parent.wait().await.is_cancelled());
        sleep(Duration::from_millis(200)).await;
        assert!(!child_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawning_into_a_cancelled_batch_cancels() {
        let batch = Batch::new("test");
        batch.cancel();

        let task = batch.spawn(async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        assert!(task.wait().await.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_reaches_tasks_spawned_concurrently() {
        let batch = Batch::new("race");
        let spawner = batch.clone();
        let producer = tokio::spawn(async move {
            for _ in 0..200 {
                spawner.spawn(async {
                    sleep(Duration::from_secs(60)).await;
                    Ok(())
                });
                tokio::task::yield_now().await;
            }
        });

        tokio::task::yield_now().await;
        batch.cancel();
        producer.await.unwrap();

        let outcomes = tokio::time::timeout(Duration::from_secs(5), batch.join())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 200);
        assert!(outcomes.iter().all(TaskOutcome::is_cancelled));
    }

    #[test]
    fn spawns_on_the_batch_handle_outside_a_runtime() {
        let tokio = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let batch = Batch::with_handle("detached", tokio.handle().clone());

        let task = batch.spawn(async { Ok(()) });
        assert!(tokio.block_on(task.wait()).is_completed());

        // Child batches inherit the handle.
        let task = batch.spawn_with(|children| async move {
            children.spawn(async { Ok(()) }).wait().await;
            Ok(())
        });
        assert!(tokio.block_on(task.wait()).is_completed());
    }

    #[test]
    fn spawning_without_a_runtime_fails_the_task() {
        let batch = Batch::new("nowhere");
        let task = batch.spawn(async { Ok(()) });

        match task.outcome() {
            Some(TaskOutcome::Failed(err)) => assert!(matches!(*err, Error::NoAsyncRuntime)),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(batch.task_count(), 1);
    }

    #[test]
    fn finished_tasks_are_kept_until_joined() {
        let tokio = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let batch = Batch::with_handle("ui", tokio.handle().clone());

        for _ in 0..3 {
            let task = batch.spawn(async { Ok(()) });
            tokio.block_on(task.wait());
        }
        assert_eq!(batch.task_count(), 3);

        assert_eq!(tokio.block_on(batch.join()).len(), 3);
        assert_eq!(batch.task_count(), 0);
    }

    #[test]
    fn same_as_compares_identity() {
        let a = Batch::new("a");
        let b = Batch::new("a");
        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
    }
}
