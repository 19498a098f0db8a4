//! Request/response engine: one RPC is one HTTP POST.
//!
//! HTTP has no server-side session, so `use`, `let` and `unset` are handled
//! locally. The selected namespace and database travel as `Surreal-NS` and
//! `Surreal-DB` headers, and cached variables are merged into every `query`.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use sdb_core::{ConnectionState, Error, RequestContext, Result, RpcRequest, RpcResponse};
use sdb_tasks::AbortSignal;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use url::Url;

use crate::connection::{ConnectionInfo, EngineContext};
use crate::engine::{Engine, EngineCore, apply_auth_effects, closed, keep_previous, resolve_use};

/// Header carrying the selected namespace.
pub const NAMESPACE_HEADER: &str = "Surreal-NS";
/// Header carrying the selected database.
pub const DATABASE_HEADER: &str = "Surreal-DB";

/// Engine speaking to the server's HTTP RPC endpoint.
pub struct HttpEngine {
    core: EngineCore,
    ctx: EngineContext,
    client: reqwest::Client,
    variables: Mutex<Map<String, Value>>,
}

impl std::fmt::Debug for HttpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEngine")
            .field("connection", &self.core.connection())
            .field("variables", &self.variables.lock().len())
            .finish_non_exhaustive()
    }
}

impl HttpEngine {
    /// Create an engine with a default `reqwest` client.
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self::with_client(ctx, reqwest::Client::new())
    }

    /// Create an engine around an existing `reqwest` client.
    #[must_use]
    pub fn with_client(ctx: EngineContext, client: reqwest::Client) -> Self {
        Self {
            core: EngineCore::new(ctx.emitter.clone()),
            ctx,
            client,
            variables: Mutex::new(Map::new()),
        }
    }

    /// Session variables currently cached.
    #[must_use]
    pub fn variables(&self) -> Map<String, Value> {
        self.variables.lock().clone()
    }

    async fn send(&self, conn: &ConnectionInfo, request: &RpcRequest) -> Result<RpcResponse> {
        let context = conn.request_context(request);
        let endpoint = conn
            .endpoint
            .clone()
            .ok_or_else(|| Error::unavailable("HTTP engine has no endpoint"))?;
        let content_type = self.ctx.formatter.content_type();
        let body = self.ctx.formatter.encode(&request.to_wire(None))?;

        let mut builder = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, content_type)
            .body(body);
        if let Some(ns) = &conn.namespace {
            builder = builder.header(NAMESPACE_HEADER, ns);
        }
        if let Some(db) = &conn.database {
            builder = builder.header(DATABASE_HEADER, db);
        }
        if let Some(token) = &conn.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| http_error(None, e.to_string(), &context))?;
        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().await.unwrap_or_default();
            return Err(http_error(Some(status), message, &context));
        }

        let value = self
            .decode_body(response)
            .await
            .map_err(|e| http_error(Some(status), format!("unreadable response body: {e}"), &context))?;
        RpcResponse::from_value(value).map_err(|e| e.for_request(&context))
    }

    async fn decode_body(&self, response: reqwest::Response) -> Result<Value> {
        let threshold = self.ctx.settings.http_stream_threshold_bytes;
        if should_stream(response.content_length(), threshold) {
            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| Error::Codec(e.to_string())))
                .boxed();
            debug!(?threshold, "stream-decoding response body");
            return self.ctx.formatter.decode_stream(chunks).await;
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Codec(e.to_string()))?;
        if bytes.is_empty() {
            return Err(Error::Codec("empty response body".into()));
        }
        self.ctx.formatter.decode(&bytes)
    }
}

/// Stream-decode when the length is unknown or above `threshold`.
#[must_use]
pub fn should_stream(content_length: Option<u64>, threshold: u64) -> bool {
    content_length.is_none_or(|len| len > threshold)
}

fn http_error(status: Option<StatusCode>, message: String, context: &RequestContext) -> Error {
    Error::Http {
        status: status.map(|s| s.as_u16()),
        message,
        context: Box::new(context.clone()),
    }
}

#[async_trait]
impl Engine for HttpEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    fn connection(&self) -> ConnectionInfo {
        self.core.connection()
    }

    #[instrument(skip(self), fields(engine = "http"))]
    async fn connect(&self, endpoint: Url) -> Result<()> {
        match self.core.state() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Closed => {}
            state => {
                return Err(Error::UnreachableState {
                    operation: "connect".into(),
                    state,
                });
            }
        }
        let _ = self
            .core
            .transition(
                ConnectionState::Connecting,
                |info| *info = ConnectionInfo::connecting(endpoint),
                closed,
            )
            .await?;
        let _ = self
            .core
            .transition(ConnectionState::Open, |_| {}, closed)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(engine = "http"))]
    async fn disconnect(&self) -> Result<()> {
        match self.core.state() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Open => {}
            state => {
                return Err(Error::UnreachableState {
                    operation: "disconnect".into(),
                    state,
                });
            }
        }
        self.variables.lock().clear();
        let _ = self
            .core
            .transition(ConnectionState::Closing, |_| {}, keep_previous)
            .await?;
        let _ = self
            .core
            .transition(ConnectionState::Closed, |info| *info = ConnectionInfo::default(), closed)
            .await?;
        Ok(())
    }

    async fn rpc(&self, request: RpcRequest, signal: Option<AbortSignal>) -> Result<RpcResponse> {
        let conn = self.core.connection();
        if conn.state != ConnectionState::Open {
            return Err(Error::unavailable(format!("HTTP engine is {}", conn.state)));
        }

        let request = match request {
            RpcRequest::Use {
                namespace,
                database,
            } => {
                let (ns, db) = resolve_use(&conn, &namespace, &database)?;
                let _ = self.core.set_session(ns, db);
                return Ok(RpcResponse::ok(Value::Null));
            }
            RpcRequest::Let { name, value } => {
                let _ = self.variables.lock().insert(name, value);
                return Ok(RpcResponse::ok(Value::Null));
            }
            RpcRequest::Unset { name } => {
                let _ = self.variables.lock().remove(&name);
                return Ok(RpcResponse::ok(Value::Null));
            }
            RpcRequest::Query { sql, vars } => {
                let mut merged = self.variables.lock().clone();
                merged.extend(vars);
                RpcRequest::Query { sql, vars: merged }
            }
            other => other,
        };

        let exchange = self.send(&conn, &request);
        let response = match signal {
            Some(signal) => tokio::select! {
                biased;
                reason = signal.cancelled() => Err(reason),
                response = exchange => response,
            },
            None => exchange.await,
        }?;

        apply_auth_effects(&self.core, &request, &response);
        Ok(response)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
