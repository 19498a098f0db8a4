//! Connection snapshot, event channels and the context engines are built with.

use std::sync::Arc;

use sdb_core::{
    ConnectionState, Error, Formatter, JsonFormatter, LiveMessage, RequestContext, RpcRequest,
    RpcResponse,
};
use sdb_settings::ConnectionSettings;
use sdb_tasks::TaskEmitter;
use url::Url;

/// Snapshot of an engine's connection.
///
/// Engines hand out copies; the stored value is replaced wholesale on every
/// transition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Target endpoint, set for every state but `Closed`.
    pub endpoint: Option<Url>,
    /// Selected namespace.
    pub namespace: Option<String>,
    /// Selected database.
    pub database: Option<String>,
    /// Bearer token for the session.
    pub token: Option<String>,
}

impl ConnectionInfo {
    /// A fresh `Connecting` snapshot for `endpoint`.
    #[must_use]
    pub fn connecting(endpoint: Url) -> Self {
        Self {
            state: ConnectionState::Connecting,
            endpoint: Some(endpoint),
            ..Self::default()
        }
    }

    /// Diagnostic context for `request` under this connection.
    #[must_use]
    pub fn request_context(&self, request: &RpcRequest) -> RequestContext {
        request.context().with_connection(
            self.endpoint.as_ref().map(ToString::to_string),
            self.namespace.clone(),
            self.database.clone(),
        )
    }
}

/// Event channel key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Fired when the connection enters a state.
    State(ConnectionState),
    /// Errors without a synchronous caller.
    Error,
    /// Reply to the RPC with this id.
    Rpc(String),
    /// Push notifications for the live query with this id.
    Live(String),
}

/// Event payload.
#[derive(Clone, Debug)]
pub enum Event {
    /// The snapshot after a transition.
    Transition(ConnectionInfo),
    /// A transport or protocol failure.
    Error(Error),
    /// A correlated RPC reply.
    Response(RpcResponse),
    /// A live-query notification.
    Live(LiveMessage),
}

/// Emitter shared by a client and the engines it creates.
pub type EngineEmitter = TaskEmitter<Channel, Event>;

/// Everything an engine needs from its owner.
#[derive(Clone)]
pub struct EngineContext {
    /// Where transitions, errors and replies are published.
    pub emitter: EngineEmitter,
    /// Wire codec.
    pub formatter: Arc<dyn Formatter>,
    /// Keep-alive and body-handling tuning.
    pub settings: ConnectionSettings,
}

impl EngineContext {
    /// Context with the JSON formatter and default settings.
    #[must_use]
    pub fn new(emitter: EngineEmitter) -> Self {
        Self {
            emitter,
            formatter: Arc::new(JsonFormatter),
            settings: ConnectionSettings::default(),
        }
    }

    /// Replace the formatter.
    #[must_use]
    pub fn with_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Replace the connection settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("emitter", &self.emitter)
            .field("content_type", &self.formatter.content_type())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_snapshot_is_closed_and_empty() {
        let info = ConnectionInfo::default();
        assert_eq!(info.state, ConnectionState::Closed);
        assert!(info.endpoint.is_none());
        assert!(info.token.is_none());
    }

    #[test]
    fn request_context_carries_connection() {
        let mut info = ConnectionInfo::connecting(Url::parse("ws://db:8000/rpc").unwrap());
        info.namespace = Some("ns".into());
        let ctx = info.request_context(&RpcRequest::query("RETURN 1", serde_json::Map::new()));
        assert_eq!(ctx.method, "query");
        assert_eq!(ctx.endpoint.as_deref(), Some("ws://db:8000/rpc"));
        assert_eq!(ctx.namespace.as_deref(), Some("ns"));
        assert_eq!(ctx.params[0], json!("RETURN 1"));
    }
}
