//! Auto-reconnect supervisor.
//!
//! [`AutoReconnect`] watches a client's `Channel::Error` and, when its
//! predicate says so, drives this chain on its own emitter:
//!
//! ```text
//! Enqueue ──► Pending ──(backoff timer)──► Connect ──┬──► Success
//!    ▲                                                │
//!    └─────────────────────── attempt + 1 ◄── Failure ┘
//! ```
//!
//! While the chain runs, [`ReconnectionInfo::phase`] walks
//! `Pending → Disconnecting → Connecting` and ends each attempt in
//! `Succeeded` or `Failed`; a failed attempt moves back to `Pending` when the
//! next one is queued.
//!
//! The backoff for attempt `n` is `min(initial * 2^n, max)`. The default
//! predicate fires on the third keep-alive failure inside a rolling window.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sdb_core::{Error, Result};
use sdb_core::retry::backoff_delay;
use sdb_engine::{Channel, Event};
use sdb_settings::ReconnectSettings;
use sdb_tasks::{AbortSignal, Listener, TaskEmitter, listener};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::Client;

/// Decides whether an error should start a reconnect.
pub type ShouldReconnect = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Overall outcome of the supervisor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReconnectState {
    /// Nothing has happened yet.
    #[default]
    Waiting,
    /// A connect attempt is running.
    Running,
    /// The last attempt succeeded.
    Success,
    /// The connection was lost or the last attempt failed.
    Failure,
}

/// Where the chain currently is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReconnectPhase {
    /// Idle.
    #[default]
    Waiting,
    /// A backoff timer is armed or about to be.
    Pending,
    /// Closing whatever the client still holds.
    Disconnecting,
    /// Opening the last target again.
    Connecting,
    /// The last attempt reconnected the client.
    Succeeded,
    /// The last attempt failed.
    Failed,
}

/// Copy of the supervisor's status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconnectionInfo {
    /// Outcome.
    pub state: ReconnectState,
    /// Chain position.
    pub phase: ReconnectPhase,
}

/// Event channel of the supervisor's chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReconnectStep {
    /// An attempt was queued.
    Enqueue,
    /// Its delay was computed and the timer armed.
    Pending,
    /// The timer fired.
    Connect,
    /// The client is connected again.
    Success,
    /// The attempt failed; another one follows.
    Failure,
}

/// Payload of a [`ReconnectStep`].
#[derive(Clone, Debug)]
pub enum ReconnectEvent {
    /// Attempt queued.
    Enqueued {
        /// Zero-based attempt number.
        attempt: u32,
    },
    /// Backoff timer armed.
    Scheduled {
        /// Zero-based attempt number.
        attempt: u32,
        /// Time until the attempt.
        delay: Duration,
    },
    /// Attempt started.
    Connecting {
        /// Zero-based attempt number.
        attempt: u32,
    },
    /// Reconnected.
    Connected {
        /// Attempts it took.
        attempts: u32,
    },
    /// Attempt failed.
    Failed {
        /// Zero-based attempt number.
        attempt: u32,
        /// Why.
        error: Error,
    },
}

/// Emitter carrying the supervisor's chain.
pub type ReconnectEmitter = TaskEmitter<ReconnectStep, ReconnectEvent>;

/// Predicate firing once `threshold` keep-alive failures fall inside `window`.
///
/// The count resets after firing. Other errors are ignored.
pub fn keep_alive_policy(threshold: usize, window: Duration) -> ShouldReconnect {
    let failures: Mutex<VecDeque<Instant>> = Mutex::new(VecDeque::new());
    Arc::new(move |error: &Error| {
        if !error.is_keep_alive_failure() {
            return false;
        }
        let now = Instant::now();
        let mut failures = failures.lock();
        while failures
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            let _ = failures.pop_front();
        }
        failures.push_back(now);
        if failures.len() >= threshold {
            failures.clear();
            return true;
        }
        false
    })
}

/// Phases kept for [`AutoReconnect::phase_history`].
const PHASE_HISTORY: usize = 64;

#[derive(Default)]
struct Status {
    info: ReconnectionInfo,
    attempt: u32,
    enabled: bool,
    timer: Option<AbortSignal>,
    scheduled: Vec<Duration>,
    phases: VecDeque<ReconnectPhase>,
}

impl Status {
    fn enter(&mut self, state: ReconnectState, phase: ReconnectPhase) {
        self.info = ReconnectionInfo { state, phase };
        if self.phases.len() == PHASE_HISTORY {
            let _ = self.phases.pop_front();
        }
        self.phases.push_back(phase);
    }
}

struct SupervisorInner {
    client: Client,
    settings: ReconnectSettings,
    emitter: ReconnectEmitter,
    status: Mutex<Status>,
    should_reconnect: RwLock<ShouldReconnect>,
    error_listener: Mutex<Option<Listener<Event>>>,
}

/// Reconnects a [`Client`] with exponential backoff.
#[derive(Clone)]
pub struct AutoReconnect {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for AutoReconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.inner.status.lock();
        f.debug_struct("AutoReconnect")
            .field("info", &status.info)
            .field("attempt", &status.attempt)
            .field("enabled", &status.enabled)
            .finish_non_exhaustive()
    }
}

impl AutoReconnect {
    /// Supervise `client`. Starts enabled when `settings.enabled` is set.
    #[must_use]
    pub fn new(client: Client, settings: ReconnectSettings) -> Self {
        let policy = keep_alive_policy(settings.failure_threshold, settings.failure_window());
        let inner = Arc::new(SupervisorInner {
            client,
            status: Mutex::new(Status {
                enabled: settings.enabled,
                ..Status::default()
            }),
            settings,
            emitter: ReconnectEmitter::new(),
            should_reconnect: RwLock::new(policy),
            error_listener: Mutex::new(None),
        });
        wire(&inner);
        Self { inner }
    }

    /// Replace the predicate deciding which errors start a reconnect.
    pub fn set_should_reconnect(&self, predicate: ShouldReconnect) {
        *self.inner.should_reconnect.write() = predicate;
    }

    /// Start a reconnect now, regardless of the predicate.
    ///
    /// Returns `false` when disabled or when a reconnect is already running
    /// or pending.
    pub fn trigger(&self) -> bool {
        self.inner.start()
    }

    /// Allow the supervisor to react again.
    pub fn enable(&self) {
        self.inner.status.lock().enabled = true;
    }

    /// Stop reacting and cancel an armed timer.
    pub fn disable(&self) {
        let mut status = self.inner.status.lock();
        status.enabled = false;
        if let Some(timer) = status.timer.take() {
            timer.abort(Error::aborted("auto-reconnect disabled"));
        }
        if status.info.phase == ReconnectPhase::Pending {
            status.enter(ReconnectState::Waiting, ReconnectPhase::Waiting);
        }
        debug!("auto-reconnect disabled");
    }

    /// Whether the supervisor reacts to errors.
    pub fn is_enabled(&self) -> bool {
        self.inner.status.lock().enabled
    }

    /// Copy of the current status.
    pub fn reconnection_info(&self) -> ReconnectionInfo {
        self.inner.status.lock().info
    }

    /// Every backoff delay scheduled so far, in order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.inner.status.lock().scheduled.clone()
    }

    /// The most recent phases entered, oldest first.
    pub fn phase_history(&self) -> Vec<ReconnectPhase> {
        self.inner.status.lock().phases.iter().copied().collect()
    }

    /// Register `listener` for `step`.
    pub fn on(&self, step: ReconnectStep, listener: Listener<ReconnectEvent>) -> Listener<ReconnectEvent> {
        self.inner.emitter.on(step, listener)
    }

    /// The chain's emitter.
    pub fn emitter(&self) -> &ReconnectEmitter {
        &self.inner.emitter
    }

    /// Wait for every chain step that is running right now.
    pub async fn idle(&self) -> Result<()> {
        self.inner.emitter.idle().await
    }

    /// Stop watching the client and cancel an armed timer.
    pub fn detach(&self) {
        self.disable();
        if let Some(handle) = self.inner.error_listener.lock().take() {
            let _ = self.inner.client.off(&Channel::Error, &handle);
        }
    }
}

fn wire(inner: &Arc<SupervisorInner>) {
    let weak = Arc::downgrade(inner);

    let _ = inner.emitter.on(
        ReconnectStep::Enqueue,
        listener({
            let weak = weak.clone();
            move |event: ReconnectEvent| {
                if let (Some(inner), ReconnectEvent::Enqueued { attempt }) = (weak.upgrade(), event) {
                    inner.schedule(attempt);
                }
                async { Ok(()) }
            }
        }),
    );

    let _ = inner.emitter.on(
        ReconnectStep::Pending,
        listener({
            let weak = weak.clone();
            move |event: ReconnectEvent| {
                if let (Some(inner), ReconnectEvent::Scheduled { attempt, delay }) =
                    (weak.upgrade(), event)
                {
                    inner.arm(attempt, delay);
                }
                async { Ok(()) }
            }
        }),
    );

    let _ = inner.emitter.on(
        ReconnectStep::Connect,
        listener({
            let weak = weak.clone();
            move |event: ReconnectEvent| {
                let inner = weak.upgrade();
                async move {
                    if let (Some(inner), ReconnectEvent::Connecting { attempt }) = (inner, event) {
                        inner.attempt(attempt).await;
                    }
                    Ok(())
                }
            }
        }),
    );

    let handle = inner.client.on(
        Channel::Error,
        listener(move |event: Event| {
            if let (Some(inner), Event::Error(error)) = (weak.upgrade(), event) {
                inner.observe(&error);
            }
            async { Ok(()) }
        }),
    );
    *inner.error_listener.lock() = Some(handle);
}

impl SupervisorInner {
    fn observe(&self, error: &Error) {
        if !self.status.lock().enabled {
            return;
        }
        let predicate = self.should_reconnect.read().clone();
        if predicate(error) {
            debug!(%error, "error triggers reconnect");
            let _ = self.start();
        }
    }

    fn start(&self) -> bool {
        let attempt = {
            let mut status = self.status.lock();
            if !status.enabled
                || status.info.state == ReconnectState::Running
                || status.info.phase == ReconnectPhase::Pending
            {
                return false;
            }
            status.enter(ReconnectState::Failure, ReconnectPhase::Pending);
            status.attempt
        };
        info!(attempt, "reconnect started");
        let _ = self
            .emitter
            .emit(&ReconnectStep::Enqueue, ReconnectEvent::Enqueued { attempt });
        true
    }

    fn schedule(&self, attempt: u32) {
        let delay = backoff_delay(
            attempt,
            self.settings.initial_delay(),
            self.settings.max_delay(),
        );
        self.status.lock().scheduled.push(delay);
        info!(attempt, ?delay, "reconnect scheduled");
        let _ = self.emitter.emit(
            &ReconnectStep::Pending,
            ReconnectEvent::Scheduled { attempt, delay },
        );
    }

    fn arm(self: &Arc<Self>, attempt: u32, delay: Duration) {
        let timer = AbortSignal::new();
        {
            let mut status = self.status.lock();
            if !status.enabled {
                return;
            }
            if let Some(previous) = status.timer.replace(timer.clone()) {
                previous.abort(Error::aborted("timer replaced"));
            }
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        drop(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => debug!(attempt, "reconnect timer cancelled"),
                () = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        let _ = inner.emitter.emit(
                            &ReconnectStep::Connect,
                            ReconnectEvent::Connecting { attempt },
                        );
                    }
                }
            }
        }));
    }

    async fn attempt(&self, attempt: u32) {
        self.status.lock().timer = None;

        match self.restore().await {
            Ok(()) => {
                {
                    let mut status = self.status.lock();
                    status.attempt = 0;
                    status.enter(ReconnectState::Success, ReconnectPhase::Succeeded);
                }
                let attempts = attempt.saturating_add(1);
                info!(attempts, "reconnected");
                let _ = self
                    .emitter
                    .emit(&ReconnectStep::Success, ReconnectEvent::Connected { attempts });
            }
            Err(error) => {
                warn!(attempt, %error, "reconnect attempt failed");
                let next = attempt.saturating_add(1);
                {
                    let mut status = self.status.lock();
                    status.attempt = next;
                    status.enter(ReconnectState::Failure, ReconnectPhase::Failed);
                }
                let _ = self
                    .emitter
                    .emit(&ReconnectStep::Failure, ReconnectEvent::Failed { attempt, error });

                let requeue = {
                    let mut status = self.status.lock();
                    if status.enabled {
                        status.enter(ReconnectState::Failure, ReconnectPhase::Pending);
                    }
                    status.enabled
                };
                if requeue {
                    let _ = self
                        .emitter
                        .emit(&ReconnectStep::Enqueue, ReconnectEvent::Enqueued { attempt: next });
                }
            }
        }
    }

    /// Close the client, then connect it to its last target again.
    async fn restore(&self) -> Result<()> {
        let target = self
            .client
            .target()
            .ok_or_else(|| Error::unavailable("no previous connection to restore"))?;

        self.status
            .lock()
            .enter(ReconnectState::Running, ReconnectPhase::Disconnecting);
        if let Err(error) = self.client.close(false).await {
            warn!(%error, "close before reconnect failed");
        }

        self.status
            .lock()
            .enter(ReconnectState::Running, ReconnectPhase::Connecting);
        self.client
            .connect_with(target.endpoint.as_str(), target.options)
            .await
    }
}
