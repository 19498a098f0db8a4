//! Task-backed event emitter.
//!
//! Every listener invocation is a task on the emitter's [`TaskQueue`], so a
//! failing listener produces a rejected [`SettledFuture`] instead of escaping
//! into the emitter. Callers that care await the futures returned by
//! [`TaskEmitter::emit`]; everyone else relies on [`TaskEmitter::dispose`] to
//! drain them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sdb_core::{Error, Result};

use crate::queue::TaskQueue;
use crate::settled::{SettledFuture, Settler};
use crate::signal::AbortSignal;

/// A registered callback. Identity (for `off`) is the `Arc` pointer.
pub type Listener<A> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Listener`].
pub fn listener<A, F, Fut>(f: F) -> Listener<A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |args| -> BoxFuture<'static, Result<()>> { Box::pin(f(args)) })
}

struct EmitterInner<K, A> {
    listeners: Mutex<HashMap<K, Vec<Listener<A>>>>,
    queue: TaskQueue,
}

impl<K: Eq + Hash, A> EmitterInner<K, A> {
    fn remove(&self, key: &K, target: &Listener<A>) -> bool {
        let mut map = self.listeners.lock();
        let Some(list) = map.get_mut(key) else {
            return false;
        };
        let Some(pos) = list.iter().position(|l| Arc::ptr_eq(l, target)) else {
            return false;
        };
        let _ = list.remove(pos);
        if list.is_empty() {
            let _ = map.remove(key);
        }
        true
    }
}

/// Typed pub/sub keyed by `K`, delivering `A` to each listener.
pub struct TaskEmitter<K, A> {
    inner: Arc<EmitterInner<K, A>>,
}

impl<K, A> Clone for TaskEmitter<K, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, A> fmt::Debug for TaskEmitter<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEmitter")
            .field("events", &self.inner.listeners.lock().len())
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl<K, A> Default for TaskEmitter<K, A>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A> TaskEmitter<K, A>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    /// Create an emitter with its own queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue(TaskQueue::new())
    }

    /// Create an emitter dispatching through `queue`.
    #[must_use]
    pub fn with_queue(queue: TaskQueue) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: Mutex::new(HashMap::new()),
                queue,
            }),
        }
    }

    /// Register `listener` for `key`. Registering the same `Arc` twice is a no-op.
    ///
    /// Returns the listener so it can be passed to [`TaskEmitter::off`].
    pub fn on(&self, key: K, listener: Listener<A>) -> Listener<A> {
        let mut map = self.inner.listeners.lock();
        let list = map.entry(key).or_default();
        if !list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            list.push(listener.clone());
        }
        listener
    }

    /// Unregister `listener`. Returns whether it was registered.
    pub fn off(&self, key: &K, listener: &Listener<A>) -> bool {
        self.inner.remove(key, listener)
    }

    /// Unregister every listener for `key`.
    pub fn off_all(&self, key: &K) {
        let _ = self.inner.listeners.lock().remove(key);
    }

    /// Number of listeners registered for `key`.
    #[must_use]
    pub fn listener_count(&self, key: &K) -> usize {
        self.inner.listeners.lock().get(key).map_or(0, Vec::len)
    }

    /// Deliver `args` to every listener of `key`, in registration order.
    ///
    /// The listener list is snapshotted first, so listeners added or removed
    /// during dispatch do not affect this delivery. Returns one future per
    /// listener (empty when nobody listens).
    pub fn emit(&self, key: &K, args: A) -> Vec<SettledFuture<()>> {
        let snapshot = match self.inner.listeners.lock().get(key) {
            Some(list) => list.clone(),
            None => return Vec::new(),
        };
        snapshot
            .into_iter()
            .map(|l| {
                let args = args.clone();
                self.inner.queue.add(move |_| l(args), None)
            })
            .collect()
    }

    /// Future for the next firing of `key`.
    ///
    /// An already-triggered `signal` rejects immediately and registers
    /// nothing. Otherwise a one-shot listener is installed; if `signal`
    /// triggers first the listener is removed and the future rejects with the
    /// signal's reason.
    pub fn once(&self, key: K, signal: Option<&AbortSignal>) -> SettledFuture<A> {
        if let Some(signal) = signal.filter(|s| s.is_aborted()) {
            return SettledFuture::rejected(signal.reason_or_default());
        }

        let (future, settler) = SettledFuture::manual();
        let settler: Arc<Mutex<Option<Settler<A>>>> = Arc::new(Mutex::new(Some(settler)));
        let done = AbortSignal::new();
        let me: ListenerSlot<A> = Arc::new(Mutex::new(None));
        let emitter: Weak<EmitterInner<K, A>> = Arc::downgrade(&self.inner);

        let handle: Listener<A> = {
            let settler = settler.clone();
            let done = done.clone();
            let me = me.clone();
            let emitter = emitter.clone();
            let key = key.clone();
            Arc::new(move |args: A| -> BoxFuture<'static, Result<()>> {
                if let Some(settler) = settler.lock().take() {
                    settler.resolve(args);
                }
                done.abort(Error::aborted("once listener fired"));
                detach(&emitter, &key, &me);
                Box::pin(async { Ok(()) })
            })
        };
        *me.lock() = Some(Arc::downgrade(&handle));
        let _ = self.on(key.clone(), handle);

        if let Some(signal) = signal.cloned() {
            drop(tokio::spawn(async move {
                tokio::select! {
                    reason = signal.cancelled() => {
                        detach(&emitter, &key, &me);
                        if let Some(settler) = settler.lock().take() {
                            settler.reject(reason);
                        }
                    }
                    () = done.token().cancelled() => {}
                }
            }));
        }

        future
    }

    /// Wait for every outstanding listener task.
    pub async fn idle(&self) -> Result<()> {
        self.inner.queue.idle().await
    }

    /// Cancel every outstanding listener task.
    pub fn abort(&self, reason: &Error) {
        self.inner.queue.abort(reason);
    }

    /// Stop dispatching and drain outstanding listener tasks.
    pub async fn dispose(&self) -> Result<()> {
        self.inner.queue.dispose().await
    }

    /// The queue listener tasks run on.
    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }
}

type ListenerSlot<A> = Arc<Mutex<Option<Weak<dyn Fn(A) -> BoxFuture<'static, Result<()>> + Send + Sync>>>>;

fn detach<K: Eq + Hash, A>(emitter: &Weak<EmitterInner<K, A>>, key: &K, me: &ListenerSlot<A>) {
    let Some(handle) = me.lock().take().and_then(|weak| weak.upgrade()) else {
        return;
    };
    if let Some(inner) = emitter.upgrade() {
        let _ = inner.remove(key, &handle);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
