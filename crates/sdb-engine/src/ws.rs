//! Persistent-socket engine.
//!
//! One socket carries every RPC. Requests get a `<method>_<n>` id and the
//! reply is routed back through the emitter's `Channel::Rpc(id)`. Frames
//! without a top-level id are live-query pushes and go to
//! `Channel::Live(query_id)`.
//!
//! Socket lifecycle per connection:
//!
//! ```text
//! connect ──► Connecting ──► socket open ──► Open ──► keep-alive loop
//!                 │                            │
//!                 └── open failed: Closed      ├── disconnect: Closing ──► close frame ──► Closed
//!                                              └── peer close / error: Closing ──► Closed
//! ```
//!
//! The reader task owns the close sequence. It aborts the socket's scope
//! signal (failing every outstanding RPC), reports abnormal close codes on
//! `Channel::Error`, completes the remaining transitions and finally settles
//! the socket's `closed` future that [`Engine::disconnect`] waits on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sdb_core::errors::{CODE_DECODE_FAILED, CODE_OPEN_FAILED, CODE_SOCKET_FAILURE};
use sdb_core::{ConnectionState, Error, Inbound, Result, RpcRequest, RpcResponse, SessionValue};
use sdb_tasks::{AbortSignal, SettledFuture, Settler};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::connection::{Channel, ConnectionInfo, EngineContext, Event};
use crate::engine::{
    Engine, EngineCore, apply_auth_effects, closed, keep_previous, resolve_use,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code used when the stream ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;
/// Close code used when a close frame carries no status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Whether a close code is reported as an error.
///
/// 1002, 1003 and 1007 to 1014 are abnormal. 1000, 1001, 1004 to 1006 and
/// 1015 are normal or early disconnects and are swallowed.
#[must_use]
pub fn is_abnormal_close(code: u16) -> bool {
    matches!(code, 1002 | 1003 | 1007..=1014)
}

/// Per-socket handles; replaced on every connect.
#[derive(Clone)]
struct Socket {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    /// Aborted when the socket closes; every in-flight RPC listens to it.
    scope: AbortSignal,
    /// Aborted when closing starts.
    keepalive: AbortSignal,
    closed: SettledFuture<()>,
}

struct WsInner {
    core: EngineCore,
    ctx: EngineContext,
    socket: Mutex<Option<Socket>>,
    /// Serializes the close sequence between `disconnect` and the reader.
    lifecycle: tokio::sync::Mutex<()>,
    rpc_counter: AtomicU64,
    socket_counter: AtomicU64,
}

/// Engine speaking to the server's WebSocket RPC endpoint.
pub struct WsEngine {
    inner: Arc<WsInner>,
}

impl std::fmt::Debug for WsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsEngine")
            .field("connection", &self.inner.core.connection())
            .field("attached", &self.inner.socket.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl WsEngine {
    /// Create a closed engine.
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            inner: Arc::new(WsInner {
                core: EngineCore::new(ctx.emitter.clone()),
                ctx,
                socket: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                rpc_counter: AtomicU64::new(0),
                socket_counter: AtomicU64::new(0),
            }),
        }
    }
}

#[async_trait]
impl Engine for WsEngine {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn connection(&self) -> ConnectionInfo {
        self.inner.core.connection()
    }

    #[instrument(skip(self), fields(engine = "ws"))]
    async fn connect(&self, endpoint: Url) -> Result<()> {
        let inner = &self.inner;
        match inner.core.state() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Closed => {}
            state => {
                return Err(Error::UnreachableState {
                    operation: "connect".into(),
                    state,
                });
            }
        }

        let target = endpoint.clone();
        let _ = inner
            .core
            .transition(
                ConnectionState::Connecting,
                |info| *info = ConnectionInfo::connecting(target),
                closed,
            )
            .await?;

        let stream = match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                inner.core.reset();
                warn!(%endpoint, error = %e, "socket failed to open");
                return Err(Error::socket(
                    CODE_SOCKET_FAILURE,
                    true,
                    format!("failed to open socket: {e}"),
                ));
            }
        };
        info!(%endpoint, "socket opened");
        let socket = inner.attach(stream);

        match inner
            .core
            .transition(ConnectionState::Open, |_| {}, keep_previous)
            .await
        {
            Ok(_) => {
                drop(tokio::spawn(keep_alive(
                    Arc::downgrade(inner),
                    socket.keepalive.clone(),
                )));
                Ok(())
            }
            Err(e) => {
                inner
                    .core
                    .emit_error(Error::socket(CODE_OPEN_FAILED, true, e.to_string()));
                let _ = socket.outbound.send(Message::Close(None));
                let _ = socket.closed.wait().await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(engine = "ws"))]
    async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let socket = {
            let _guard = inner.lifecycle.lock().await;
            match inner.core.state() {
                ConnectionState::Closed => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(Error::UnreachableState {
                        operation: "disconnect".into(),
                        state: ConnectionState::Connecting,
                    });
                }
                ConnectionState::Open => {
                    let _ = inner
                        .core
                        .transition(ConnectionState::Closing, |_| {}, keep_previous)
                        .await?;
                }
                ConnectionState::Closing => {}
            }
            let socket = inner.socket.lock().clone();
            if socket.is_none() {
                // Nothing left to close; settle the lifecycle here.
                inner.finish_close().await;
                return Ok(());
            }
            socket
        };

        let Some(socket) = socket else {
            return Ok(());
        };
        socket.keepalive.abort(Error::aborted("disconnecting"));
        if socket.outbound.send(Message::Close(None)).is_err() {
            debug!("socket writer already stopped");
        }
        socket.closed.wait().await
    }

    async fn rpc(&self, request: RpcRequest, signal: Option<AbortSignal>) -> Result<RpcResponse> {
        self.inner.rpc(request, signal).await
    }
}

impl WsInner {
    fn attach(self: &Arc<Self>, stream: WsStream) -> Socket {
        let (sink, stream) = stream.split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let (closed_future, closed_settler) = SettledFuture::manual();
        let socket = Socket {
            id: self.socket_counter.fetch_add(1, Ordering::Relaxed) + 1,
            outbound,
            scope: AbortSignal::new(),
            keepalive: AbortSignal::new(),
            closed: closed_future,
        };
        *self.socket.lock() = Some(socket.clone());
        drop(tokio::spawn(write_loop(sink, rx)));
        drop(tokio::spawn(read_loop(
            self.clone(),
            stream,
            socket.clone(),
            closed_settler,
        )));
        socket
    }

    async fn rpc(&self, request: RpcRequest, signal: Option<AbortSignal>) -> Result<RpcResponse> {
        let conn = self.core.connection();
        if conn.state != ConnectionState::Open {
            return Err(Error::unavailable(format!("socket is {}", conn.state)));
        }
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or_else(|| Error::unavailable("socket is not attached"))?;

        let request = match request {
            RpcRequest::Use {
                namespace,
                database,
            } => {
                let (ns, db) = resolve_use(&conn, &namespace, &database)?;
                RpcRequest::use_ns_db(SessionValue::from_resolved(ns), SessionValue::from_resolved(db))
            }
            other => other,
        };

        let n = self.rpc_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}_{n}", request.method());
        let scope = match &signal {
            Some(caller) => AbortSignal::any(&[caller.clone(), socket.scope.clone()]),
            None => socket.scope.child(),
        };
        let reply = self
            .core
            .emitter()
            .once(Channel::Rpc(id.clone()), Some(&scope));

        let sent = self.encode(&request.to_wire(Some(&id))).and_then(|frame| {
            socket
                .outbound
                .send(frame)
                .map_err(|_| Error::unavailable("socket writer is closed"))
        });
        let outcome = match sent {
            Ok(()) => reply.wait().await,
            Err(e) => Err(e),
        };
        scope.abort(Error::aborted("rpc settled"));

        let Event::Response(response) = outcome? else {
            return Err(
                Error::malformed(format!("unexpected event on reply channel `{id}`"), None)
                    .for_request(&conn.request_context(&request)),
            );
        };

        if response.result.is_ok() {
            if let RpcRequest::Use {
                namespace,
                database,
            } = &request
            {
                // Another `use` landed while this one was in flight; keep its
                // selection and report the race.
                let now = self.core.connection();
                if now.namespace != conn.namespace || now.database != conn.database {
                    return Err(Error::UseConflict {
                        expected_namespace: conn.namespace,
                        expected_database: conn.database,
                        actual_namespace: now.namespace,
                        actual_database: now.database,
                    });
                }
                let _ = self
                    .core
                    .set_session(namespace.resolve(None), database.resolve(None));
            }
            apply_auth_effects(&self.core, &request, &response);
        }
        Ok(response)
    }

    fn encode(&self, value: &Value) -> Result<Message> {
        let bytes = self.ctx.formatter.encode(value)?;
        if self.ctx.formatter.is_binary() {
            return Ok(Message::Binary(bytes.into()));
        }
        String::from_utf8(bytes)
            .map(|text| Message::Text(text.into()))
            .map_err(|e| Error::Codec(e.to_string()))
    }

    fn handle_frame(&self, bytes: &[u8]) {
        let frame = match self.ctx.formatter.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable frame");
                self.core
                    .emit_error(Error::socket(CODE_DECODE_FAILED, false, e.to_string()));
                return;
            }
        };
        match Inbound::classify(frame) {
            Ok(Inbound::Response(response)) => {
                let id = response.id.clone().unwrap_or_default();
                let delivered = self
                    .core
                    .emitter()
                    .emit(&Channel::Rpc(id.clone()), Event::Response(response));
                if delivered.is_empty() {
                    debug!(%id, "reply for an rpc nobody awaits");
                }
            }
            Ok(Inbound::Live(message)) => {
                let channel = Channel::Live(message.query_id.clone());
                let _ = self.core.emitter().emit(&channel, Event::Live(message));
            }
            Err(e) => {
                warn!(error = %e, "protocol error");
                self.core.emit_error(e);
            }
        }
    }

    async fn handle_close(&self, socket: &Socket, code: u16, reason: &str) {
        let _guard = self.lifecycle.lock().await;
        socket.keepalive.abort(Error::aborted("socket closed"));
        socket.scope.abort(Error::socket(
            code,
            false,
            format!("socket closed before reply: {code}"),
        ));
        {
            let mut current = self.socket.lock();
            if current.as_ref().is_some_and(|s| s.id == socket.id) {
                *current = None;
            }
        }

        if is_abnormal_close(code) {
            warn!(code, reason, "socket closed abnormally");
            self.core.emit_error(Error::socket(
                code,
                false,
                format!("socket closed abnormally: {reason}"),
            ));
        } else {
            info!(code, "socket closed");
        }

        match self.core.state() {
            ConnectionState::Open => {
                match self
                    .core
                    .transition(ConnectionState::Closing, |_| {}, closed)
                    .await
                {
                    Ok(_) => self.finish_close().await,
                    Err(e) => warn!(error = %e, "closing transition failed"),
                }
            }
            ConnectionState::Closing => self.finish_close().await,
            ConnectionState::Connecting => self.core.reset(),
            ConnectionState::Closed => {}
        }
    }

    async fn finish_close(&self) {
        if let Err(e) = self
            .core
            .transition(
                ConnectionState::Closed,
                |info| *info = ConnectionInfo::default(),
                closed,
            )
            .await
        {
            warn!(error = %e, "closed transition failed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "socket write failed");
            break;
        }
        if is_close {
            break;
        }
    }
}

async fn read_loop(
    inner: Arc<WsInner>,
    mut stream: SplitStream<WsStream>,
    socket: Socket,
    closed_settler: Settler<()>,
) {
    let (code, reason) = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => inner.handle_frame(text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => inner.handle_frame(&bytes),
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or((CLOSE_NO_STATUS, String::new()), |f| {
                    (u16::from(f.code), f.reason.to_string())
                });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                inner
                    .core
                    .emit_error(Error::socket(CODE_SOCKET_FAILURE, true, e.to_string()));
                break (CLOSE_ABNORMAL, e.to_string());
            }
            None => break (CLOSE_ABNORMAL, String::new()),
        }
    };
    inner.handle_close(&socket, code, &reason).await;
    closed_settler.resolve(());
}

async fn keep_alive(inner: Weak<WsInner>, stop: AbortSignal) {
    loop {
        let Some(engine) = inner.upgrade() else {
            break;
        };
        let interval = engine.ctx.settings.ping_interval();
        let timeout = engine.ctx.settings.ping_timeout();
        drop(engine);

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        let Some(engine) = inner.upgrade() else {
            break;
        };
        let deadline = AbortSignal::timeout(timeout);
        let guard = AbortSignal::any(&[deadline.clone(), stop.clone()]);
        let outcome = engine.rpc(RpcRequest::ping(), Some(guard.clone())).await;
        deadline.abort(Error::aborted("ping settled"));
        guard.abort(Error::aborted("ping settled"));

        if stop.is_aborted() {
            break;
        }
        if let Err(e) = outcome {
            warn!(error = %e, "keep-alive ping failed");
            engine.core.emit_error(Error::KeepAlive {
                message: e.to_string(),
            });
        }
    }
    debug!("keep-alive loop stopped");
}
