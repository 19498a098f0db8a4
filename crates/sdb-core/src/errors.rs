//! Error taxonomy for the connection runtime.
//!
//! Every failure in the workspace is an [`Error`]. Variants fall into the
//! categories reported by [`Error::category`]:
//!
//! - **Configuration**: engine lookup and endpoint problems; never retried
//! - **Session**: namespace/database selection conflicts; the connection survives
//! - **Transport**: HTTP and socket failures, malformed frames, timeouts
//! - **Rpc**: the server answered with an error body
//! - **Aggregate**: several task failures collected together
//! - **Lifecycle**: disposal and state-transition failures
//!
//! The enum is `Clone` so that a settled outcome can be replayed to every
//! observer of a settled future.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rpc::RpcMethod;
use crate::state::ConnectionState;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Socket failure (error handler fired).
pub const CODE_SOCKET_FAILURE: u16 = 3150;
/// The `OPEN` transition failed after the socket opened.
pub const CODE_OPEN_FAILED: u16 = 3151;
/// An inbound frame could not be decoded.
pub const CODE_DECODE_FAILED: u16 = 3152;

const REDACTED: &str = "[redacted]";
const SECRET_KEYS: &[&str] = &["pass", "password", "secret", "token"];

// ─────────────────────────────────────────────────────────────────────────────
// Category
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Misconfiguration; fail fast, never retry.
    Configuration,
    /// Session-level conflict surfaced to the triggering caller.
    Session,
    /// Transport failure surfaced to the RPC caller.
    Transport,
    /// The server rejected an RPC.
    Rpc,
    /// Several task failures collected together.
    Aggregate,
    /// Resource lifecycle violations.
    Lifecycle,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Session => write!(f, "session"),
            Self::Transport => write!(f, "transport"),
            Self::Rpc => write!(f, "rpc"),
            Self::Aggregate => write!(f, "aggregate"),
            Self::Lifecycle => write!(f, "lifecycle"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request context
// ─────────────────────────────────────────────────────────────────────────────

/// Diagnostic context attached to transport and RPC errors.
///
/// Carries enough to reproduce the failing call without a second round trip.
/// Credentials are redacted from `params` on construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// RPC method name.
    pub method: String,
    /// Positional parameters with secrets redacted.
    pub params: Vec<Value>,
    /// Endpoint the request was sent to.
    pub endpoint: Option<String>,
    /// Selected namespace at the time of the call.
    pub namespace: Option<String>,
    /// Selected database at the time of the call.
    pub database: Option<String>,
}

impl RequestContext {
    /// Build a context, redacting credentials from `params`.
    #[must_use]
    pub fn new(method: RpcMethod, params: &[Value]) -> Self {
        Self {
            method: method.as_str().to_owned(),
            params: redact_params(method, params),
            endpoint: None,
            namespace: None,
            database: None,
        }
    }

    /// Attach the connection details the call was made under.
    #[must_use]
    pub fn with_connection(
        mut self,
        endpoint: Option<String>,
        namespace: Option<String>,
        database: Option<String>,
    ) -> Self {
        self.endpoint = endpoint;
        self.namespace = namespace;
        self.database = database;
        self
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.method)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " @ {endpoint}")?;
        }
        if let Some(ns) = &self.namespace {
            write!(f, " ns={ns}")?;
        }
        if let Some(db) = &self.database {
            write!(f, " db={db}")?;
        }
        Ok(())
    }
}

/// Replace credentials in RPC params with a placeholder.
///
/// `authenticate` carries a bare token; `signin`/`signup` carry an object
/// whose secret fields are masked.
#[must_use]
pub fn redact_params(method: RpcMethod, params: &[Value]) -> Vec<Value> {
    match method {
        RpcMethod::Authenticate => params
            .iter()
            .map(|_| Value::String(REDACTED.to_owned()))
            .collect(),
        RpcMethod::Signin | RpcMethod::Signup => params.iter().map(redact_value).collect(),
        _ => params.to_vec(),
    }
}

fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if SECRET_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                        Value::String(REDACTED.to_owned())
                    } else {
                        redact_value(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

/// Every failure the connection runtime can report.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// No engine is registered for a connection-string scheme.
    #[error("no engine registered for scheme `{scheme}`")]
    EngineNotFound {
        /// The unresolved scheme.
        scheme: String,
    },

    /// The engine alias table maps a scheme back onto itself.
    #[error("circular engine reference: {}", chain.join(" -> "))]
    CircularEngineReference {
        /// Schemes visited, ending with the repeated one.
        chain: Vec<String>,
    },

    /// The endpoint could not be used as a connection target.
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint {
        /// The offending endpoint.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The engine was asked to do something its current state forbids.
    #[error("unreachable state: cannot {operation} while {state}")]
    UnreachableState {
        /// The attempted operation.
        operation: String,
        /// The state the engine was in.
        state: ConnectionState,
    },

    /// A database was selected without a namespace.
    #[error("cannot select a database without selecting a namespace")]
    MissingNamespace,

    /// A connect targeted a different endpoint while another is open.
    #[error("already connected to {current}; close it before connecting to {requested}")]
    ConnectionConflict {
        /// Endpoint of the open connection.
        current: String,
        /// Endpoint the caller asked for.
        requested: String,
    },

    /// The namespace/database changed underneath an in-flight `use`.
    #[error(
        "use conflict: expected ns={expected_namespace:?} db={expected_database:?}, \
         found ns={actual_namespace:?} db={actual_database:?}"
    )]
    UseConflict {
        /// Namespace observed when the `use` was sent.
        expected_namespace: Option<String>,
        /// Database observed when the `use` was sent.
        expected_database: Option<String>,
        /// Namespace observed when the reply arrived.
        actual_namespace: Option<String>,
        /// Database observed when the reply arrived.
        actual_database: Option<String>,
    },

    /// No open connection is available for the call.
    #[error("connection unavailable: {reason}")]
    ConnectionUnavailable {
        /// Why the connection cannot serve the call.
        reason: String,
    },

    /// HTTP exchange failed or returned a non-200 status.
    #[error("HTTP request for {context} failed{}: {message}", status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    Http {
        /// Response status, when a response was received.
        status: Option<u16>,
        /// Transport message or response body.
        message: String,
        /// The failing request.
        context: Box<RequestContext>,
    },

    /// A response or frame did not have the expected shape.
    #[error("malformed response{}: {message}", context.as_ref().map(|c| format!(" to {c}")).unwrap_or_default())]
    MalformedResponse {
        /// What was wrong with it.
        message: String,
        /// The raw payload, when one was decoded.
        payload: Option<Value>,
        /// The request it answered, when known.
        context: Option<Box<RequestContext>>,
    },

    /// Persistent-socket failure carrying a numeric code.
    #[error("socket error {code}: {message}")]
    Socket {
        /// Close code or one of the `CODE_*` constants.
        code: u16,
        /// Whether the connection must be torn down.
        fatal: bool,
        /// Description of the failure.
        message: String,
    },

    /// A keep-alive probe did not complete.
    #[error("keep-alive probe failed: {message}")]
    KeepAlive {
        /// Underlying probe failure.
        message: String,
    },

    /// The server answered an RPC with an error body.
    #[error("RPC {context} failed with code {code}: {message}")]
    RpcResponse {
        /// Server error code.
        code: i64,
        /// Server error message.
        message: String,
        /// The failing request.
        context: Box<RequestContext>,
    },

    /// The formatter could not encode or decode a value.
    #[error("codec error: {0}")]
    Codec(String),

    /// A cancellable operation was aborted.
    #[error("aborted: {reason}")]
    Aborted {
        /// Why the operation was aborted.
        reason: String,
    },

    /// A timeout signal fired.
    #[error("timed out after {after_ms}ms")]
    Timeout {
        /// Duration that elapsed.
        after_ms: u64,
    },

    /// One or more tracked tasks failed.
    #[error("{} task(s) failed: {}", errors.len(), errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    AggregateTasks {
        /// Every failure, in completion order.
        errors: Vec<Error>,
    },

    /// The resource was disposed and no longer accepts work.
    #[error("{resource} already disposed")]
    AlreadyDisposed {
        /// Name of the disposed resource.
        resource: String,
    },

    /// A listener vetoed a transition; the snapshot was rolled back.
    #[error("transition {from} -> {to} failed (rolled back to {fallback}): {}", errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    StateTransition {
        /// State before the transition.
        from: ConnectionState,
        /// Target state.
        to: ConnectionState,
        /// State restored by the fallback.
        fallback: ConnectionState,
        /// Every listener failure.
        errors: Vec<Error>,
    },

    /// A settler was dropped without settling.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an [`Error::Aborted`].
    #[must_use]
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Build an [`Error::ConnectionUnavailable`].
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            reason: reason.into(),
        }
    }

    /// Build an [`Error::Socket`].
    #[must_use]
    pub fn socket(code: u16, fatal: bool, message: impl Into<String>) -> Self {
        Self::Socket {
            code,
            fatal,
            message: message.into(),
        }
    }

    /// Build an [`Error::MalformedResponse`].
    #[must_use]
    pub fn malformed(message: impl Into<String>, payload: Option<Value>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
            payload,
            context: None,
        }
    }

    /// Attach the request a malformed response answered. Other variants
    /// are returned unchanged.
    #[must_use]
    pub fn for_request(self, request: &RequestContext) -> Self {
        match self {
            Self::MalformedResponse {
                message, payload, ..
            } => Self::MalformedResponse {
                message,
                payload,
                context: Some(Box::new(request.clone())),
            },
            other => other,
        }
    }

    /// Coarse classification.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EngineNotFound { .. }
            | Self::CircularEngineReference { .. }
            | Self::InvalidEndpoint { .. }
            | Self::UnreachableState { .. } => ErrorCategory::Configuration,
            Self::MissingNamespace | Self::ConnectionConflict { .. } | Self::UseConflict { .. } => {
                ErrorCategory::Session
            }
            Self::ConnectionUnavailable { .. }
            | Self::Http { .. }
            | Self::MalformedResponse { .. }
            | Self::Socket { .. }
            | Self::KeepAlive { .. }
            | Self::Codec(_)
            | Self::Aborted { .. }
            | Self::Timeout { .. } => ErrorCategory::Transport,
            Self::RpcResponse { .. } => ErrorCategory::Rpc,
            Self::AggregateTasks { .. } => ErrorCategory::Aggregate,
            Self::AlreadyDisposed { .. } | Self::StateTransition { .. } | Self::Internal(_) => {
                ErrorCategory::Lifecycle
            }
        }
    }

    /// Whether the error requires the connection to be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Socket { fatal: true, .. })
    }

    /// Numeric socket code, when the error carries one.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Socket { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error came from a failed keep-alive probe.
    #[must_use]
    pub fn is_keep_alive_failure(&self) -> bool {
        matches!(self, Self::KeepAlive { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
