//! The engine abstraction: a guarded four-state connection machine.
//!
//! [`EngineCore`] owns the connection snapshot. Concrete engines drive it
//! through [`EngineCore::transition`], which publishes the new state and
//! rolls back if any listener fails. Engines never write the snapshot
//! directly, apart from the state-gated session setters.

use async_trait::async_trait;
use parking_lot::RwLock;
use sdb_core::{ConnectionState, Error, Result, RpcMethod, RpcRequest, RpcResponse, SessionValue};
use sdb_tasks::AbortSignal;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::connection::{Channel, ConnectionInfo, EngineEmitter, Event};

// ─────────────────────────────────────────────────────────────────────────────
// Engine trait
// ─────────────────────────────────────────────────────────────────────────────

/// A transport-specific implementation of the connection lifecycle and RPC path.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Short tag identifying the transport.
    fn name(&self) -> &'static str;

    /// Copy of the current connection snapshot.
    fn connection(&self) -> ConnectionInfo;

    /// Open a connection to `endpoint`. A no-op when already open.
    async fn connect(&self, endpoint: Url) -> Result<()>;

    /// Tear the connection down. A no-op when already closed.
    async fn disconnect(&self) -> Result<()>;

    /// Send one RPC and return the server's reply.
    async fn rpc(&self, request: RpcRequest, signal: Option<AbortSignal>) -> Result<RpcResponse>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Core state machine
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot storage and guarded transitions shared by every engine.
#[derive(Debug)]
pub struct EngineCore {
    slot: RwLock<Slot>,
    emitter: EngineEmitter,
}

/// The stored snapshot and the number of writes that replaced its state.
#[derive(Debug, Default)]
struct Slot {
    info: ConnectionInfo,
    generation: u64,
}

impl Slot {
    fn replace(&mut self, info: ConnectionInfo) -> u64 {
        self.info = info;
        self.generation += 1;
        self.generation
    }
}

impl EngineCore {
    /// A `Closed` core publishing on `emitter`.
    #[must_use]
    pub fn new(emitter: EngineEmitter) -> Self {
        Self {
            slot: RwLock::new(Slot::default()),
            emitter,
        }
    }

    /// Copy of the snapshot.
    #[must_use]
    pub fn connection(&self) -> ConnectionInfo {
        self.slot.read().info.clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.slot.read().info.state
    }

    /// The emitter transitions are published on.
    #[must_use]
    pub fn emitter(&self) -> &EngineEmitter {
        &self.emitter
    }

    /// Move to `target`, which must follow the current state in the cycle
    /// `Connecting → Open → Closing → Closed → Connecting`.
    ///
    /// The snapshot is computed by applying `update` to a copy of the current
    /// one, stored, and published on `Channel::State(target)`. Every listener
    /// task is awaited; if any fails, the snapshot is replaced with
    /// `fallback(previous)` and the transition fails with every listener
    /// error. A rollback only lands while the stored snapshot is still the
    /// one this transition wrote; if another transition or [`reset`] moved
    /// the state meanwhile, that newer state stands.
    ///
    /// [`reset`]: EngineCore::reset
    pub async fn transition<U, F>(
        &self,
        target: ConnectionState,
        update: U,
        fallback: F,
    ) -> Result<ConnectionInfo>
    where
        U: FnOnce(&mut ConnectionInfo) + Send,
        F: FnOnce(&ConnectionInfo) -> ConnectionInfo + Send,
    {
        let (previous, next, written) = {
            let mut slot = self.slot.write();
            let previous = slot.info.clone();
            if previous.state.next() != target {
                return Err(Error::UnreachableState {
                    operation: format!("transition to {target}"),
                    state: previous.state,
                });
            }
            let mut next = previous.clone();
            update(&mut next);
            next.state = target;
            let written = slot.replace(next.clone());
            (previous, next, written)
        };
        debug!(from = %previous.state, to = %target, "connection transition");

        let listeners = self
            .emitter
            .emit(&Channel::State(target), Event::Transition(next.clone()));
        let outcomes = futures::future::join_all(listeners.iter().map(|l| l.wait())).await;
        let errors: Vec<Error> = outcomes.into_iter().filter_map(std::result::Result::err).collect();
        if errors.is_empty() {
            return Ok(next);
        }

        let fallback_state = {
            let mut slot = self.slot.write();
            if slot.generation == written {
                let _ = slot.replace(fallback(&previous));
            } else {
                debug!(current = %slot.info.state, "state moved on during transition, rollback skipped");
            }
            slot.info.state
        };
        warn!(
            from = %previous.state,
            to = %target,
            fallback = %fallback_state,
            failures = errors.len(),
            "transition vetoed, rolled back"
        );
        Err(Error::StateTransition {
            from: previous.state,
            to: target,
            fallback: fallback_state,
            errors,
        })
    }

    /// Silently return to a fresh `Closed` snapshot.
    pub fn reset(&self) {
        let _ = self.slot.write().replace(ConnectionInfo::default());
    }

    /// Set the namespace. Ignored unless open.
    pub fn set_namespace(&self, namespace: Option<String>) -> bool {
        self.with_open(|info| info.namespace = namespace)
    }

    /// Set the database. Ignored unless open.
    pub fn set_database(&self, database: Option<String>) -> bool {
        self.with_open(|info| info.database = database)
    }

    /// Set namespace and database together. Ignored unless open.
    pub fn set_session(&self, namespace: Option<String>, database: Option<String>) -> bool {
        self.with_open(|info| {
            info.namespace = namespace;
            info.database = database;
        })
    }

    /// Set the token. Ignored unless open.
    pub fn set_token(&self, token: Option<String>) -> bool {
        self.with_open(|info| info.token = token)
    }

    fn with_open(&self, apply: impl FnOnce(&mut ConnectionInfo)) -> bool {
        let mut slot = self.slot.write();
        if slot.info.state != ConnectionState::Open {
            return false;
        }
        apply(&mut slot.info);
        true
    }

    /// Publish an error on `Channel::Error`.
    pub fn emit_error(&self, error: Error) {
        debug!(%error, fatal = error.is_fatal(), "publishing connection error");
        let _ = self.emitter.emit(&Channel::Error, Event::Error(error));
    }
}

/// Fallback that restores the snapshot from before the transition.
pub fn keep_previous(previous: &ConnectionInfo) -> ConnectionInfo {
    previous.clone()
}

/// Fallback that drops to a fresh `Closed` snapshot.
pub fn closed(_: &ConnectionInfo) -> ConnectionInfo {
    ConnectionInfo::default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Session rules shared by engines
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve a `use` against the current selection.
///
/// A database without a namespace is rejected.
pub fn resolve_use(
    current: &ConnectionInfo,
    namespace: &SessionValue,
    database: &SessionValue,
) -> Result<(Option<String>, Option<String>)> {
    let ns = namespace.resolve(current.namespace.as_deref());
    let db = database.resolve(current.database.as_deref());
    if db.is_some() && ns.is_none() {
        return Err(Error::MissingNamespace);
    }
    Ok((ns, db))
}

/// Record token changes caused by a successful auth call.
pub fn apply_auth_effects(core: &EngineCore, request: &RpcRequest, response: &RpcResponse) {
    let Ok(result) = &response.result else {
        return;
    };
    match request.method() {
        RpcMethod::Signin | RpcMethod::Signup => {
            if let Some(token) = token_from_result(result) {
                let _ = core.set_token(Some(token));
            }
        }
        RpcMethod::Authenticate => {
            let token = request
                .params()
                .first()
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            let _ = core.set_token(token);
        }
        RpcMethod::Invalidate => {
            let _ = core.set_token(None);
        }
        _ => {}
    }
}

fn token_from_result(result: &Value) -> Option<String> {
    match result {
        Value::String(token) => Some(token.clone()),
        Value::Object(map) => map.get("token").and_then(Value::as_str).map(ToOwned::to_owned),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
