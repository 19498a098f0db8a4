//! Settled-state futures.
//!
//! A [`SettledFuture`] is a cloneable handle to a value that will eventually
//! be fulfilled or rejected. It never fails on its own: the outcome is stored
//! once and replayed to every observer, including observers that arrive after
//! settlement. Only [`SettledFuture::wait`] (or `.await`) turns a stored
//! rejection into an `Err` for the caller that asked.

use std::fmt;
use std::future::{Future, IntoFuture};

use futures::future::BoxFuture;
use sdb_core::{Error, Result};
use tokio::sync::watch;

/// Observable state of a [`SettledFuture`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettledState {
    /// Not yet settled.
    Pending,
    /// Settled with a value.
    Fulfilled,
    /// Settled with an error.
    Rejected,
}

#[derive(Debug)]
enum Slot<T> {
    Pending,
    Settled(Result<T>),
}

/// A value holder that always completes and remembers its outcome.
pub struct SettledFuture<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T> Clone for SettledFuture<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> fmt::Debug for SettledFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettledFuture")
            .field("state", &self.state())
            .finish()
    }
}

/// The write half of a manually settled future.
///
/// Dropping it unsettled rejects the future with [`Error::Internal`].
pub struct Settler<T> {
    tx: watch::Sender<Slot<T>>,
}

impl<T> Settler<T> {
    /// Fulfil the future.
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    /// Reject the future.
    pub fn reject(self, error: Error) {
        self.settle(Err(error));
    }

    /// Settle with an outcome.
    pub fn settle(self, outcome: Result<T>) {
        let _ = self.tx.send_replace(Slot::Settled(outcome));
    }
}

impl<T> SettledFuture<T> {
    /// Create a pending future together with its [`Settler`].
    #[must_use]
    pub fn manual() -> (Self, Settler<T>) {
        let (tx, rx) = watch::channel(Slot::Pending);
        (Self { rx }, Settler { tx })
    }

    /// A future that is already fulfilled.
    #[must_use]
    pub fn fulfilled(value: T) -> Self {
        let (tx, rx) = watch::channel(Slot::Settled(Ok(value)));
        drop(tx);
        Self { rx }
    }

    /// A future that is already rejected.
    #[must_use]
    pub fn rejected(error: Error) -> Self {
        let (tx, rx) = watch::channel(Slot::Settled(Err(error)));
        drop(tx);
        Self { rx }
    }

    /// Current state without waiting.
    #[must_use]
    pub fn state(&self) -> SettledState {
        match &*self.rx.borrow() {
            Slot::Settled(Ok(_)) => SettledState::Fulfilled,
            Slot::Settled(Err(_)) => SettledState::Rejected,
            // Settler dropped without settling.
            Slot::Pending if self.rx.has_changed().is_err() => SettledState::Rejected,
            Slot::Pending => SettledState::Pending,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SettledFuture<T> {
    /// Run `future` on the runtime and settle with its output.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (settled, settler) = Self::manual();
        drop(tokio::spawn(async move {
            settler.settle(future.await);
        }));
        settled
    }

    /// The stored outcome, if settled.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T>> {
        match &*self.rx.borrow() {
            Slot::Settled(outcome) => Some(outcome.clone()),
            Slot::Pending => None,
        }
    }

    /// Wait for settlement and return the outcome.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(|slot| matches!(slot, Slot::Settled(_))).await {
            Ok(slot) => match &*slot {
                Slot::Settled(outcome) => outcome.clone(),
                Slot::Pending => Err(Error::Internal("settled future observed pending".into())),
            },
            Err(_) => Err(Error::Internal("settler dropped before settling".into())),
        };
        result
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for SettledFuture<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
