//! The connection client.
//!
//! A [`Client`] turns a connection string into an engine through its
//! [`EngineTable`], keeps at most one engine active, and routes RPC calls to
//! it. Engines are created with the client's [`EngineContext`], so every
//! engine publishes on the same emitter and listeners registered on the
//! client survive reconnection.
//!
//! `connect`, `close` and `reconnect` are serialized by one async lock. RPC
//! calls do not take it: they run as tasks on the emitter's queue, wait out
//! a connect attempt in progress, and fail fast otherwise.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use sdb_core::{
    ConnectionState, Error, LiveMessage, Result, RpcMethod, RpcRequest, SessionValue,
};
use sdb_engine::{
    Channel, ConnectionInfo, Engine, EngineContext, EngineEmitter, Event, HttpEngine, WsEngine,
};
use sdb_tasks::{AbortSignal, Listener, SettledFuture, TaskContext, listener};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Builds an engine for a resolved scheme.
pub type EngineFactory = Arc<dyn Fn(EngineContext) -> Arc<dyn Engine> + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Engine table
// ─────────────────────────────────────────────────────────────────────────────

/// One entry of the engine table.
#[derive(Clone)]
pub enum EngineEntry {
    /// Build an engine.
    Factory(EngineFactory),
    /// Resolve through another scheme.
    Alias(String),
}

impl std::fmt::Debug for EngineEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Factory(_) => f.write_str("Factory(..)"),
            Self::Alias(target) => f.debug_tuple("Alias").field(target).finish(),
        }
    }
}

/// Scheme → engine mapping. Entries may alias other schemes.
#[derive(Clone, Debug)]
pub struct EngineTable {
    entries: HashMap<String, EngineEntry>,
}

impl Default for EngineTable {
    /// `ws`/`wss` use the WebSocket engine, `http`/`https` the HTTP engine.
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(
            "ws",
            Arc::new(|ctx| Arc::new(WsEngine::new(ctx)) as Arc<dyn Engine>),
        );
        table.alias("wss", "ws");
        table.register(
            "http",
            Arc::new(|ctx| Arc::new(HttpEngine::new(ctx)) as Arc<dyn Engine>),
        );
        table.alias("https", "http");
        table
    }
}

impl EngineTable {
    /// A table with no entries.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Map `scheme` to `factory`, replacing any previous entry.
    pub fn register(&mut self, scheme: impl Into<String>, factory: EngineFactory) {
        let _ = self
            .entries
            .insert(scheme.into(), EngineEntry::Factory(factory));
    }

    /// Make `scheme` resolve like `target`.
    pub fn alias(&mut self, scheme: impl Into<String>, target: impl Into<String>) {
        let _ = self
            .entries
            .insert(scheme.into(), EngineEntry::Alias(target.into()));
    }

    /// Remove the entry for `scheme`.
    pub fn remove(&mut self, scheme: &str) -> Option<EngineEntry> {
        self.entries.remove(scheme)
    }

    /// Follow aliases from `scheme` to a factory.
    pub fn resolve(&self, scheme: &str) -> Result<EngineFactory> {
        let mut seen: Vec<String> = Vec::new();
        let mut current = scheme.to_owned();
        loop {
            if seen.contains(&current) {
                seen.push(current);
                return Err(Error::CircularEngineReference { chain: seen });
            }
            match self.entries.get(&current) {
                None => return Err(Error::EngineNotFound { scheme: current }),
                Some(EngineEntry::Factory(factory)) => return Ok(factory.clone()),
                Some(EngineEntry::Alias(target)) => {
                    let next = target.clone();
                    seen.push(current);
                    current = next;
                }
            }
        }
    }
}

/// Parse a connection string, appending `/rpc` to network endpoints.
///
/// `ws://db:8000` and `ws://db:8000/` both become `ws://db:8000/rpc`. Other
/// schemes are left untouched.
pub fn normalize_endpoint(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|e| Error::InvalidEndpoint {
        endpoint: raw.to_owned(),
        reason: e.to_string(),
    })?;
    if matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
        let path = url.path().trim_end_matches('/').to_owned();
        if path.ends_with("/rpc") {
            url.set_path(&path);
        } else {
            url.set_path(&format!("{path}/rpc"));
        }
    }
    Ok(url)
}

// ─────────────────────────────────────────────────────────────────────────────
// Connect options
// ─────────────────────────────────────────────────────────────────────────────

/// Session applied right after the engine opens.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Namespace to select.
    pub namespace: Option<String>,
    /// Database to select.
    pub database: Option<String>,
    /// Token to authenticate with.
    pub token: Option<String>,
}

impl ConnectOptions {
    /// Select `namespace`.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Select `database`.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Authenticate with `token`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("namespace", &self.namespace)
            .field("database", &self.database)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// The endpoint and session of the most recent connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Normalized endpoint.
    pub endpoint: Url,
    /// Session applied after open.
    pub options: ConnectOptions,
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Active {
    engine: Arc<dyn Engine>,
    endpoint: Url,
}

struct Attempt {
    endpoint: Url,
    done: SettledFuture<()>,
}

struct ClientInner {
    ctx: EngineContext,
    engines: RwLock<EngineTable>,
    lifecycle: tokio::sync::Mutex<()>,
    active: RwLock<Option<Active>>,
    attempt: Mutex<Option<Attempt>>,
    target: Mutex<Option<Target>>,
    default_errors: Mutex<Option<Listener<Event>>>,
}

/// Connection client. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection())
            .field("engines", &self.inner.engines.read())
            .finish_non_exhaustive()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// A client using the process-wide connection settings.
    #[must_use]
    pub fn new() -> Self {
        let settings = sdb_settings::get_settings().connection.clone();
        Self::with_context(EngineContext::new(EngineEmitter::new()).with_settings(settings))
    }

    /// A client whose engines are built with `ctx`.
    ///
    /// Installs the default error handler: fatal errors force-close the
    /// connection, others are logged.
    #[must_use]
    pub fn with_context(ctx: EngineContext) -> Self {
        let client = Self {
            inner: Arc::new(ClientInner {
                ctx,
                engines: RwLock::new(EngineTable::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                active: RwLock::new(None),
                attempt: Mutex::new(None),
                target: Mutex::new(None),
                default_errors: Mutex::new(None),
            }),
        };
        let weak = Arc::downgrade(&client.inner);
        let handle = client.on(
            Channel::Error,
            listener(move |event: Event| {
                if let Event::Error(error) = event {
                    handle_connection_error(&weak, error);
                }
                async { Ok(()) }
            }),
        );
        *client.inner.default_errors.lock() = Some(handle);
        client
    }

    /// Remove the default error handler. Returns whether it was installed.
    pub fn remove_default_error_handler(&self) -> bool {
        match self.inner.default_errors.lock().take() {
            Some(handle) => self.off(&Channel::Error, &handle),
            None => false,
        }
    }

    // ── Engine table ──

    /// Map `scheme` to an engine factory.
    pub fn register_engine(&self, scheme: impl Into<String>, factory: EngineFactory) {
        self.inner.engines.write().register(scheme, factory);
    }

    /// Make `scheme` resolve like `target`.
    pub fn alias_engine(&self, scheme: impl Into<String>, target: impl Into<String>) {
        self.inner.engines.write().alias(scheme, target);
    }

    /// Remove the entry for `scheme`.
    pub fn remove_engine(&self, scheme: &str) -> Option<EngineEntry> {
        self.inner.engines.write().remove(scheme)
    }

    // ── Lifecycle ──

    /// Connect to `endpoint` without session options.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        self.connect_with(endpoint, ConnectOptions::default()).await
    }

    /// Connect to `endpoint`, then apply `options`.
    ///
    /// Idempotent for the endpoint already open. A caller arriving while an
    /// attempt for the same endpoint is in flight shares its outcome. A
    /// different endpoint while open fails with [`Error::ConnectionConflict`].
    #[instrument(skip(self, options))]
    pub async fn connect_with(&self, endpoint: &str, options: ConnectOptions) -> Result<()> {
        let endpoint = normalize_endpoint(endpoint)?;
        let shared = self
            .inner
            .attempt
            .lock()
            .as_ref()
            .filter(|attempt| attempt.endpoint == endpoint)
            .map(|attempt| attempt.done.clone());
        if let Some(done) = shared {
            debug!(%endpoint, "joining connect attempt in flight");
            return done.wait().await;
        }

        let _guard = self.inner.lifecycle.lock().await;
        self.inner.open(endpoint, options).await
    }

    /// Close the active engine.
    ///
    /// With `force`, every pending task (RPC calls and listener runs) is
    /// aborted first so in-flight calls fail fast.
    #[instrument(skip(self))]
    pub async fn close(&self, force: bool) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if force {
            self.inner
                .ctx
                .emitter
                .abort(&Error::aborted("client closed"));
        }
        let active = self.inner.active.write().take();
        match active {
            Some(active) => self.inner.shutdown(&active).await,
            None => Ok(()),
        }
    }

    /// Close whatever is active and connect again to the last target.
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        let target = self
            .inner
            .target
            .lock()
            .clone()
            .ok_or_else(|| Error::unavailable("no previous connection to restore"))?;
        let active = self.inner.active.write().take();
        if let Some(active) = active {
            if let Err(e) = self.inner.shutdown(&active).await {
                warn!(error = %e, "closing before reconnect failed");
            }
        }
        self.inner.open(target.endpoint, target.options).await
    }

    // ── RPC ──

    /// Call `method` with positional `params`.
    ///
    /// Waits for a connect attempt in flight; otherwise requires an open
    /// connection. A server error body becomes [`Error::RpcResponse`].
    pub async fn rpc(
        &self,
        method: RpcMethod,
        params: Vec<Value>,
        signal: Option<&AbortSignal>,
    ) -> Result<Value> {
        let request = RpcRequest::from_parts(method, params)?;
        self.submit(request, signal).wait().await
    }

    /// Select namespace and database. `None` keeps the current value.
    pub async fn use_ns_db(&self, namespace: Option<&str>, database: Option<&str>) -> Result<()> {
        let request =
            RpcRequest::use_ns_db(SessionValue::from(namespace), SessionValue::from(database));
        let _ = self.submit(request, None).wait().await?;
        Ok(())
    }

    /// Run `sql` with bound variables.
    pub async fn query(&self, sql: &str, vars: serde_json::Map<String, Value>) -> Result<Value> {
        self.rpc(
            RpcMethod::Query,
            vec![Value::String(sql.to_owned()), Value::Object(vars)],
            None,
        )
        .await
    }

    /// Run `request` as a task on the emitter's queue.
    fn submit(&self, request: RpcRequest, signal: Option<&AbortSignal>) -> SettledFuture<Value> {
        let inner = self.inner.clone();
        self.inner.ctx.emitter.queue().add(
            move |task: TaskContext| async move { inner.dispatch(request, task.signal).await },
            signal,
        )
    }

    // ── Events ──

    /// The emitter shared with every engine.
    pub fn emitter(&self) -> &EngineEmitter {
        &self.inner.ctx.emitter
    }

    /// Register `listener` on `channel`.
    pub fn on(&self, channel: Channel, listener: Listener<Event>) -> Listener<Event> {
        self.inner.ctx.emitter.on(channel, listener)
    }

    /// Remove `listener` from `channel`.
    pub fn off(&self, channel: &Channel, listener: &Listener<Event>) -> bool {
        self.inner.ctx.emitter.off(channel, listener)
    }

    /// Deliver notifications for live query `query_id` to `handler`.
    ///
    /// Returns the registered listener, for [`Client::unsubscribe_live`].
    pub fn subscribe_live<F, Fut>(&self, query_id: impl Into<String>, handler: F) -> Listener<Event>
    where
        F: Fn(LiveMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on(
            Channel::Live(query_id.into()),
            listener(move |event: Event| {
                let delivery = match event {
                    Event::Live(message) => Some(handler(message)),
                    _ => None,
                };
                async move {
                    match delivery {
                        Some(delivery) => delivery.await,
                        None => Ok(()),
                    }
                }
            }),
        )
    }

    /// Stop delivering notifications for `query_id` to `listener`.
    pub fn unsubscribe_live(&self, query_id: &str, listener: &Listener<Event>) -> bool {
        self.off(&Channel::Live(query_id.to_owned()), listener)
    }

    // ── Introspection ──

    /// Snapshot of the active engine's connection, `Closed` when none.
    pub fn connection(&self) -> ConnectionInfo {
        self.inner
            .active
            .read()
            .as_ref()
            .map(|active| active.engine.connection())
            .unwrap_or_default()
    }

    /// State of the active engine.
    pub fn state(&self) -> ConnectionState {
        self.connection().state
    }

    /// Name of the active engine.
    pub fn engine_name(&self) -> Option<&'static str> {
        self.inner
            .active
            .read()
            .as_ref()
            .map(|active| active.engine.name())
    }

    /// The most recent connect target.
    pub fn target(&self) -> Option<Target> {
        self.inner.target.lock().clone()
    }
}

impl ClientInner {
    /// Connect to `endpoint`. The lifecycle lock must be held.
    async fn open(&self, endpoint: Url, options: ConnectOptions) -> Result<()> {
        let current = self.active.read().clone();
        if let Some(active) = current {
            match active.engine.connection().state {
                ConnectionState::Open if active.endpoint == endpoint => return Ok(()),
                ConnectionState::Open => {
                    return Err(Error::ConnectionConflict {
                        current: active.endpoint.to_string(),
                        requested: endpoint.to_string(),
                    });
                }
                ConnectionState::Closed => {}
                _ => {
                    if let Err(e) = self.shutdown(&active).await {
                        warn!(error = %e, "closing stale engine failed");
                    }
                }
            }
        }

        let factory = self.engines.read().resolve(endpoint.scheme())?;
        let engine = factory(self.ctx.clone());
        debug!(engine = engine.name(), %endpoint, "engine resolved");

        let (done, settler) = SettledFuture::manual();
        *self.attempt.lock() = Some(Attempt {
            endpoint: endpoint.clone(),
            done,
        });
        *self.active.write() = Some(Active {
            engine: engine.clone(),
            endpoint: endpoint.clone(),
        });
        *self.target.lock() = Some(Target {
            endpoint: endpoint.clone(),
            options: options.clone(),
        });

        let outcome = establish(engine.as_ref(), &endpoint, &options).await;
        *self.attempt.lock() = None;
        match &outcome {
            Ok(()) => info!(%endpoint, engine = engine.name(), "connected"),
            Err(e) => {
                warn!(%endpoint, error = %e, "connect failed");
                *self.active.write() = None;
            }
        }
        settler.settle(outcome.clone());
        outcome
    }

    /// Disconnect `active`, abandoning it if the close handshake stalls.
    async fn shutdown(&self, active: &Active) -> Result<()> {
        let bound = self.ctx.settings.ping_timeout();
        match tokio::time::timeout(bound, active.engine.disconnect()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(endpoint = %active.endpoint, "engine did not close in time, abandoning it");
                Ok(())
            }
        }
    }

    async fn dispatch(&self, request: RpcRequest, signal: AbortSignal) -> Result<Value> {
        let engine = self.ready_engine().await?;
        call(engine.as_ref(), request, Some(signal)).await
    }

    async fn ready_engine(&self) -> Result<Arc<dyn Engine>> {
        let pending = self
            .attempt
            .lock()
            .as_ref()
            .map(|attempt| attempt.done.clone());
        if let Some(done) = pending {
            done.wait().await?;
        }
        let active = self
            .active
            .read()
            .clone()
            .ok_or_else(|| Error::unavailable("not connected"))?;
        match active.engine.connection().state {
            ConnectionState::Open => Ok(active.engine),
            state => Err(Error::unavailable(format!("connection is {state}"))),
        }
    }
}

async fn establish(engine: &dyn Engine, endpoint: &Url, options: &ConnectOptions) -> Result<()> {
    engine.connect(endpoint.clone()).await?;
    if let Err(e) = apply_options(engine, options).await {
        if let Err(close) = engine.disconnect().await {
            warn!(error = %close, "disconnect after failed session setup failed");
        }
        return Err(e);
    }
    Ok(())
}

async fn apply_options(engine: &dyn Engine, options: &ConnectOptions) -> Result<()> {
    if options.namespace.is_some() || options.database.is_some() {
        let request = RpcRequest::use_ns_db(
            SessionValue::from(options.namespace.as_deref()),
            SessionValue::from(options.database.as_deref()),
        );
        let _ = call(engine, request, None).await?;
    }
    if let Some(token) = &options.token {
        let request =
            RpcRequest::from_parts(RpcMethod::Authenticate, vec![Value::String(token.clone())])?;
        let _ = call(engine, request, None).await?;
    }
    Ok(())
}

async fn call(engine: &dyn Engine, request: RpcRequest, signal: Option<AbortSignal>) -> Result<Value> {
    let context = engine.connection().request_context(&request);
    engine.rpc(request, signal).await?.into_result(context)
}

fn handle_connection_error(client: &Weak<ClientInner>, error: Error) {
    if !error.is_fatal() {
        warn!(%error, "connection error");
        return;
    }
    let Some(inner) = client.upgrade() else {
        return;
    };
    warn!(%error, "fatal connection error, forcing close");
    drop(tokio::spawn(async move {
        if let Err(e) = (Client { inner }).close(true).await {
            warn!(error = %e, "forced close failed");
        }
    }));
}
