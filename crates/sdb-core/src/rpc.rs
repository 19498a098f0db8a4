//! RPC wire types.
//!
//! The method catalogue is fixed. Most methods are opaque positional calls;
//! `use`, `let`, `unset` and `query` are reinterpreted by the engines and so
//! get dedicated [`RpcRequest`] variants.
//!
//! Wire shapes:
//!
//! ```text
//! outbound   {id?, method, params}
//! response   {id, result} | {id, error: {code, message}}
//! live push  {result: {id, action, result}}          (no top-level id)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::{Error, RequestContext, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Method catalogue
// ─────────────────────────────────────────────────────────────────────────────

/// Every RPC method the server understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcMethod {
    /// Liveness probe.
    Ping,
    /// Select namespace and database.
    Use,
    /// Information about the authenticated record.
    Info,
    /// Sign up a record user.
    Signup,
    /// Sign in.
    Signin,
    /// Authenticate with an existing token.
    Authenticate,
    /// Drop the current authentication.
    Invalidate,
    /// Define a session variable.
    Let,
    /// Remove a session variable.
    Unset,
    /// Start a live query.
    Live,
    /// Stop a live query.
    Kill,
    /// Run a query.
    Query,
    /// Select records.
    Select,
    /// Create a record.
    Create,
    /// Insert records.
    Insert,
    /// Replace records.
    Update,
    /// Create or replace records.
    Upsert,
    /// Merge into records.
    Merge,
    /// Apply JSON patches.
    Patch,
    /// Delete records.
    Delete,
    /// Server version.
    Version,
    /// Run a function.
    Run,
    /// Create a graph edge.
    Relate,
}

impl RpcMethod {
    /// Every method in catalogue order.
    pub const ALL: [Self; 23] = [
        Self::Ping,
        Self::Use,
        Self::Info,
        Self::Signup,
        Self::Signin,
        Self::Authenticate,
        Self::Invalidate,
        Self::Let,
        Self::Unset,
        Self::Live,
        Self::Kill,
        Self::Query,
        Self::Select,
        Self::Create,
        Self::Insert,
        Self::Update,
        Self::Upsert,
        Self::Merge,
        Self::Patch,
        Self::Delete,
        Self::Version,
        Self::Run,
        Self::Relate,
    ];

    /// Wire name of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Use => "use",
            Self::Info => "info",
            Self::Signup => "signup",
            Self::Signin => "signin",
            Self::Authenticate => "authenticate",
            Self::Invalidate => "invalidate",
            Self::Let => "let",
            Self::Unset => "unset",
            Self::Live => "live",
            Self::Kill => "kill",
            Self::Query => "query",
            Self::Select => "select",
            Self::Create => "create",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Upsert => "upsert",
            Self::Merge => "merge",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Version => "version",
            Self::Run => "run",
            Self::Relate => "relate",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::malformed(format!("unknown RPC method `{s}`"), None))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session tri-state
// ─────────────────────────────────────────────────────────────────────────────

/// A namespace/database selector distinguishing "leave alone" from "clear".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionValue {
    /// Keep whatever is currently selected.
    #[default]
    Keep,
    /// Explicitly clear the selection.
    Clear,
    /// Select this value.
    Set(String),
}

impl SessionValue {
    /// Interpret a positional `use` parameter: absent keeps, `null` clears.
    pub fn from_param(param: Option<&Value>) -> Result<Self> {
        match param {
            None => Ok(Self::Keep),
            Some(Value::Null) => Ok(Self::Clear),
            Some(Value::String(s)) => Ok(Self::Set(s.clone())),
            Some(other) => Err(Error::malformed(
                "namespace and database must be strings or null",
                Some(other.clone()),
            )),
        }
    }

    /// Apply to the current value, yielding the resulting selection.
    #[must_use]
    pub fn resolve(&self, current: Option<&str>) -> Option<String> {
        match self {
            Self::Keep => current.map(ToOwned::to_owned),
            Self::Clear => None,
            Self::Set(v) => Some(v.clone()),
        }
    }

    /// Collapse a resolved selection back into `Set`/`Clear`.
    #[must_use]
    pub fn from_resolved(value: Option<String>) -> Self {
        value.map_or(Self::Clear, Self::Set)
    }

    fn to_param(&self) -> Value {
        match self {
            Self::Set(v) => Value::String(v.clone()),
            Self::Keep | Self::Clear => Value::Null,
        }
    }
}

impl From<Option<&str>> for SessionValue {
    fn from(value: Option<&str>) -> Self {
        value.map_or(Self::Keep, |v| Self::Set(v.to_owned()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// One RPC call.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcRequest {
    /// Select namespace and/or database.
    Use {
        /// Namespace selector.
        namespace: SessionValue,
        /// Database selector.
        database: SessionValue,
    },
    /// Define a session variable.
    Let {
        /// Variable name without the `$`.
        name: String,
        /// Variable value.
        value: Value,
    },
    /// Remove a session variable.
    Unset {
        /// Variable name without the `$`.
        name: String,
    },
    /// Run a query with bound variables.
    Query {
        /// Query text.
        sql: String,
        /// Explicit variables.
        vars: Map<String, Value>,
    },
    /// Any other method, forwarded with its positional parameters.
    Call {
        /// Method to call.
        method: RpcMethod,
        /// Positional parameters.
        params: Vec<Value>,
    },
}

impl RpcRequest {
    /// Build a request from a method and its positional parameters.
    pub fn from_parts(method: RpcMethod, params: Vec<Value>) -> Result<Self> {
        match method {
            RpcMethod::Use => Ok(Self::Use {
                namespace: SessionValue::from_param(params.first())?,
                database: SessionValue::from_param(params.get(1))?,
            }),
            RpcMethod::Let => {
                let mut params = params.into_iter();
                let name = expect_name(params.next(), method)?;
                Ok(Self::Let {
                    name,
                    value: params.next().unwrap_or(Value::Null),
                })
            }
            RpcMethod::Unset => Ok(Self::Unset {
                name: expect_name(params.into_iter().next(), method)?,
            }),
            RpcMethod::Query => {
                let mut params = params.into_iter();
                let sql = match params.next() {
                    Some(Value::String(sql)) => sql,
                    other => {
                        return Err(Error::malformed("query text must be a string", other));
                    }
                };
                let vars = match params.next() {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(vars)) => vars,
                    Some(other) => {
                        return Err(Error::malformed(
                            "query variables must be an object",
                            Some(other),
                        ));
                    }
                };
                Ok(Self::Query { sql, vars })
            }
            method => Ok(Self::Call { method, params }),
        }
    }

    /// A `ping` request.
    #[must_use]
    pub fn ping() -> Self {
        Self::Call {
            method: RpcMethod::Ping,
            params: Vec::new(),
        }
    }

    /// A `use` request.
    #[must_use]
    pub fn use_ns_db(namespace: SessionValue, database: SessionValue) -> Self {
        Self::Use {
            namespace,
            database,
        }
    }

    /// A `query` request.
    #[must_use]
    pub fn query(sql: impl Into<String>, vars: Map<String, Value>) -> Self {
        Self::Query {
            sql: sql.into(),
            vars,
        }
    }

    /// A `let` request.
    #[must_use]
    pub fn let_var(name: impl Into<String>, value: Value) -> Self {
        Self::Let {
            name: name.into(),
            value,
        }
    }

    /// Method this request calls.
    #[must_use]
    pub fn method(&self) -> RpcMethod {
        match self {
            Self::Use { .. } => RpcMethod::Use,
            Self::Let { .. } => RpcMethod::Let,
            Self::Unset { .. } => RpcMethod::Unset,
            Self::Query { .. } => RpcMethod::Query,
            Self::Call { method, .. } => *method,
        }
    }

    /// Positional wire parameters.
    ///
    /// `SessionValue::Keep` encodes as `null`; engines that support a server
    /// session resolve `Keep` against their snapshot before sending.
    #[must_use]
    pub fn params(&self) -> Vec<Value> {
        match self {
            Self::Use {
                namespace,
                database,
            } => vec![namespace.to_param(), database.to_param()],
            Self::Let { name, value } => vec![Value::String(name.clone()), value.clone()],
            Self::Unset { name } => vec![Value::String(name.clone())],
            Self::Query { sql, vars } => {
                vec![Value::String(sql.clone()), Value::Object(vars.clone())]
            }
            Self::Call { params, .. } => params.clone(),
        }
    }

    /// Wire body `{id?, method, params}`.
    #[must_use]
    pub fn to_wire(&self, id: Option<&str>) -> Value {
        let mut body = json!({
            "method": self.method().as_str(),
            "params": self.params(),
        });
        if let (Some(id), Value::Object(map)) = (id, &mut body) {
            let _ = map.insert("id".into(), Value::String(id.to_owned()));
        }
        body
    }

    /// Diagnostic context with credentials redacted.
    #[must_use]
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.method(), &self.params())
    }
}

fn expect_name(param: Option<Value>, method: RpcMethod) -> Result<String> {
    match param {
        Some(Value::String(name)) => Ok(name),
        other => Err(Error::malformed(
            format!("`{method}` expects a variable name"),
            other,
        )),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────────────────────────────────────

/// Error body returned by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Server error code.
    #[serde(default = "default_error_code")]
    pub code: i64,
    /// Server error message.
    pub message: String,
}

fn default_error_code() -> i64 {
    -1
}

/// A decoded RPC response.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResponse {
    /// Correlation id, absent for HTTP and local responses.
    pub id: Option<String>,
    /// Result or error body.
    pub result: std::result::Result<Value, RpcErrorBody>,
}

impl RpcResponse {
    /// A successful response with no id.
    #[must_use]
    pub fn ok(value: Value) -> Self {
        Self {
            id: None,
            result: Ok(value),
        }
    }

    /// Decode from a wire value; requires a `result` or `error` member.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::malformed("response is not an object", Some(value)));
        };
        let id = match map.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => {
                return Err(Error::malformed("response id must be a string", Some(other)));
            }
        };
        if let Some(error) = map.remove("error") {
            let body = match error {
                Value::String(message) => RpcErrorBody {
                    code: default_error_code(),
                    message,
                },
                other => serde_json::from_value(other)?,
            };
            return Ok(Self {
                id,
                result: Err(body),
            });
        }
        match map.remove("result") {
            Some(result) => Ok(Self {
                id,
                result: Ok(result),
            }),
            None => Err(Error::malformed(
                "response has neither `result` nor `error`",
                Some(Value::Object(map)),
            )),
        }
    }

    /// Unwrap into the result value or an [`Error::RpcResponse`].
    pub fn into_result(self, context: RequestContext) -> Result<Value> {
        self.result.map_err(|body| Error::RpcResponse {
            code: body.code,
            message: body.message,
            context: Box::new(context),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Live queries
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of change a live-query notification reports.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LiveAction {
    /// A record was created.
    Create,
    /// A record was updated.
    Update,
    /// A record was deleted.
    Delete,
    /// The live query was terminated by the server.
    Close,
    /// An action this client does not know.
    Other(String),
}

impl From<&str> for LiveAction {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Self::Create,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CLOSE" | "KILLED" => Self::Close,
            _ => Self::Other(s.to_owned()),
        }
    }
}

/// A live-query push notification.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveMessage {
    /// Id of the live query the notification belongs to.
    pub query_id: String,
    /// What changed.
    pub action: LiveAction,
    /// The affected record (or diff).
    pub result: Value,
}

/// Classification of an inbound persistent-socket frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Reply to an outstanding RPC.
    Response(RpcResponse),
    /// Live-query push.
    Live(LiveMessage),
}

impl Inbound {
    /// Classify a decoded frame.
    ///
    /// A frame with an `id` is a response; a frame whose `result` is an
    /// object carrying its own `id` is a live push; anything else is a
    /// protocol error.
    pub fn classify(frame: Value) -> Result<Self> {
        let has_id = frame.get("id").is_some_and(|id| !id.is_null());
        if has_id {
            return RpcResponse::from_value(frame).map(Self::Response);
        }
        let live = frame
            .get("result")
            .and_then(Value::as_object)
            .and_then(|result| {
                let query_id = result.get("id")?.as_str()?.to_owned();
                let action = result
                    .get("action")
                    .and_then(Value::as_str)
                    .map_or(LiveAction::Other(String::new()), LiveAction::from);
                let payload = result.get("result").cloned().unwrap_or(Value::Null);
                Some(LiveMessage {
                    query_id,
                    action,
                    result: payload,
                })
            });
        live.map(Self::Live)
            .ok_or_else(|| Error::malformed("frame is neither a response nor a live push", Some(frame)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
