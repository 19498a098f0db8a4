//! Cooperative task queue.
//!
//! Every task added to a [`TaskQueue`] runs on the tokio runtime, raced
//! against its own [`AbortSignal`]. The queue tracks live tasks only: a task
//! removes itself on settlement whatever the outcome, so [`TaskQueue::count`]
//! is the number of operations still in flight.
//!
//! Aborting never poisons the queue; only its current tasks are cancelled.
//! Disposal is the one terminal operation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sdb_core::{Error, Result};
use tracing::debug;

use crate::settled::SettledFuture;
use crate::signal::AbortSignal;

/// Handed to every task runner.
#[derive(Clone, Debug)]
pub struct TaskContext {
    /// Triggered when the task is cancelled, directly or through the caller's signal.
    pub signal: AbortSignal,
}

struct TaskEntry {
    signal: AbortSignal,
    done: SettledFuture<()>,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<u64, TaskEntry>,
    next_id: u64,
    disposed: bool,
}

/// Tracks in-flight cancellable operations.
#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TaskQueue")
            .field("count", &state.tasks.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl TaskQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a task and return its settled future without waiting.
    ///
    /// The task's signal is a child of `signal` when one is given, so
    /// cancelling the caller cancels the task. The runner is invoked before
    /// this returns; the future it produces is driven on the runtime.
    pub fn add<T, F, Fut>(&self, runner: F, signal: Option<&AbortSignal>) -> SettledFuture<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (id, task_signal, done) = {
            let mut state = self.inner.lock();
            if state.disposed {
                return SettledFuture::rejected(Error::AlreadyDisposed {
                    resource: "task queue".into(),
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            let task_signal = signal.map_or_else(AbortSignal::new, AbortSignal::child);
            let (done_future, done) = SettledFuture::manual();
            let _ = state.tasks.insert(
                id,
                TaskEntry {
                    signal: task_signal.clone(),
                    done: done_future,
                },
            );
            (id, task_signal, done)
        };

        let future = runner(TaskContext {
            signal: task_signal.clone(),
        });
        let (result, settler) = SettledFuture::manual();
        let queue: Weak<Mutex<QueueState>> = Arc::downgrade(&self.inner);

        drop(tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                // A task born cancelled never reports success.
                reason = task_signal.cancelled() => Err(reason),
                out = future => out,
            };
            if let Some(inner) = queue.upgrade() {
                let _ = inner.lock().tasks.remove(&id);
            }
            done.settle(outcome.as_ref().map(|_| ()).map_err(Clone::clone));
            settler.settle(outcome);
        }));

        result
    }

    /// Request cancellation of every live task.
    pub fn abort(&self, reason: &Error) {
        let signals: Vec<AbortSignal> = self
            .inner
            .lock()
            .tasks
            .values()
            .map(|t| t.signal.clone())
            .collect();
        debug!(count = signals.len(), %reason, "aborting queued tasks");
        for signal in signals {
            signal.abort(reason.clone());
        }
    }

    /// Stop accepting tasks and wait for every live one.
    ///
    /// Returns every failure collected into [`Error::AggregateTasks`]. A
    /// second call finds nothing left to wait for and succeeds.
    pub async fn dispose(&self) -> Result<()> {
        let pending = {
            let mut state = self.inner.lock();
            state.disposed = true;
            snapshot(&state)
        };
        collect(pending).await
    }

    /// Wait for every task that is live right now, without disposing.
    pub async fn idle(&self) -> Result<()> {
        let pending = snapshot(&self.inner.lock());
        collect(pending).await
    }

    /// Number of live tasks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Whether [`TaskQueue::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }
}

fn snapshot(state: &QueueState) -> Vec<(u64, SettledFuture<()>)> {
    let mut pending: Vec<_> = state
        .tasks
        .iter()
        .map(|(id, task)| (*id, task.done.clone()))
        .collect();
    pending.sort_by_key(|(id, _)| *id);
    pending
}

async fn collect(pending: Vec<(u64, SettledFuture<()>)>) -> Result<()> {
    let outcomes = futures::future::join_all(pending.iter().map(|(_, done)| done.wait())).await;
    let errors: Vec<Error> = outcomes.into_iter().filter_map(std::result::Result::err).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::AggregateTasks { errors })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
