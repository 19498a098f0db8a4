//! Reason-carrying cancellation signals.
//!
//! An [`AbortSignal`] wraps a [`CancellationToken`] and remembers *why* it was
//! triggered. Triggering is idempotent and the first reason wins. A request
//! that arrives before anyone waits on the signal is not lost: every later
//! [`AbortSignal::cancelled`] call resolves immediately with the stored reason.
//!
//! Timeouts are ordinary signals that trigger themselves after a duration.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, select_all};
use parking_lot::Mutex;
use sdb_core::Error;
use tokio_util::sync::CancellationToken;

/// A cancellation token that carries a reason once triggered.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<Error>>>,
    parent: Option<Box<AbortSignal>>,
}

impl AbortSignal {
    /// Create an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
            parent: None,
        }
    }

    /// Create a signal that is already triggered with `reason`.
    #[must_use]
    pub fn aborted(reason: Error) -> Self {
        let signal = Self::new();
        signal.abort(reason);
        signal
    }

    /// Create a child: triggered when this signal is, but abortable alone.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(Mutex::new(None)),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Create a signal that triggers itself after `duration`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        let signal = Self::new();
        let timer = signal.clone();
        drop(tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(duration) => {
                    #[allow(clippy::cast_possible_truncation)]
                    timer.abort(Error::Timeout { after_ms: duration.as_millis() as u64 });
                }
                () = timer.token.cancelled() => {}
            }
        }));
        signal
    }

    /// Create a signal triggered by whichever of `signals` triggers first.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn any(signals: &[AbortSignal]) -> Self {
        let combined = Self::new();
        if let Some(already) = signals.iter().find(|s| s.is_aborted()) {
            combined.abort(already.reason_or_default());
            return combined;
        }
        if signals.is_empty() {
            return combined;
        }
        let waiters: Vec<BoxFuture<'static, Error>> = signals
            .iter()
            .cloned()
            .map(|s| -> BoxFuture<'static, Error> { Box::pin(async move { s.cancelled().await }) })
            .collect();
        let target = combined.clone();
        drop(tokio::spawn(async move {
            tokio::select! {
                (reason, _, _) = select_all(waiters) => target.abort(reason),
                () = target.token.cancelled() => {}
            }
        }));
        combined
    }

    /// Trigger the signal. Only the first reason is kept.
    pub fn abort(&self, reason: Error) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() && !self.token.is_cancelled() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Whether the signal has been triggered (directly or through a parent).
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason, if triggered.
    #[must_use]
    pub fn reason(&self) -> Option<Error> {
        if !self.is_aborted() {
            return None;
        }
        if let Some(reason) = self.reason.lock().clone() {
            return Some(reason);
        }
        self.parent.as_ref().and_then(|p| p.reason())
    }

    /// The reason, or a generic abort error when none was recorded.
    #[must_use]
    pub fn reason_or_default(&self) -> Error {
        self.reason()
            .unwrap_or_else(|| Error::aborted("operation aborted"))
    }

    /// Wait until the signal triggers and return its reason.
    pub async fn cancelled(&self) -> Error {
        self.token.cancelled().await;
        self.reason_or_default()
    }

    /// The underlying token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
