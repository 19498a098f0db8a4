//! In-memory engine registered through the client's engine table.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sdb_client::Client;
use sdb_core::{ConnectionState, Error, Result, RpcErrorBody, RpcRequest, RpcResponse};
use sdb_engine::engine::{apply_auth_effects, closed, keep_previous, resolve_use};
use sdb_engine::{ConnectionInfo, Engine, EngineContext, EngineCore, EngineEmitter};
use sdb_settings::ConnectionSettings;
use sdb_tasks::AbortSignal;
use serde_json::{Value, json};
use url::Url;

/// Knobs and counters shared by every engine the factory builds.
#[derive(Default)]
pub struct MockBehaviour {
    /// Engines that reached the connect step.
    pub connects: AtomicU32,
    /// The next N connects fail.
    pub fail_connects: AtomicU32,
    /// Delay inside connect, in milliseconds.
    pub connect_delay_ms: AtomicU64,
    /// Queries never answer; they wait for their signal.
    pub hang: AtomicBool,
    /// Every request that reached an open engine.
    pub requests: Mutex<Vec<RpcRequest>>,
}

impl MockBehaviour {
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.method().to_string())
            .collect()
    }
}

pub struct MockEngine {
    core: EngineCore,
    behaviour: Arc<MockBehaviour>,
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connection(&self) -> ConnectionInfo {
        self.core.connection()
    }

    async fn connect(&self, endpoint: Url) -> Result<()> {
        if self.core.state() == ConnectionState::Open {
            return Ok(());
        }
        let _ = self
            .core
            .transition(
                ConnectionState::Connecting,
                |info| *info = ConnectionInfo::connecting(endpoint),
                closed,
            )
            .await?;
        let _ = self.behaviour.connects.fetch_add(1, Ordering::SeqCst);

        let delay = self.behaviour.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failed = self
            .behaviour
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            self.core.reset();
            return Err(Error::socket(3150, true, "connection refused"));
        }
        let _ = self
            .core
            .transition(ConnectionState::Open, |_| {}, closed)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        match self.core.state() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Connecting => {
                self.core.reset();
                return Ok(());
            }
            _ => {}
        }
        let _ = self
            .core
            .transition(ConnectionState::Closing, |_| {}, keep_previous)
            .await?;
        let _ = self
            .core
            .transition(
                ConnectionState::Closed,
                |info| *info = ConnectionInfo::default(),
                closed,
            )
            .await?;
        Ok(())
    }

    async fn rpc(&self, request: RpcRequest, signal: Option<AbortSignal>) -> Result<RpcResponse> {
        if self.core.state() != ConnectionState::Open {
            return Err(Error::unavailable("mock engine is not open"));
        }
        self.behaviour.requests.lock().push(request.clone());

        let response = match &request {
            RpcRequest::Use {
                namespace,
                database,
            } => {
                let (ns, db) = resolve_use(&self.core.connection(), namespace, database)?;
                let _ = self.core.set_session(ns, db);
                RpcResponse::ok(Value::Null)
            }
            RpcRequest::Query { .. } if self.behaviour.hang.load(Ordering::SeqCst) => {
                let signal = signal.unwrap_or_default();
                return Err(signal.cancelled().await);
            }
            RpcRequest::Query { sql, .. } if sql == "THROW" => RpcResponse {
                id: None,
                result: Err(RpcErrorBody {
                    code: 400,
                    message: "thrown on purpose".into(),
                }),
            },
            RpcRequest::Query { sql, vars } => RpcResponse::ok(json!({ "sql": sql, "vars": vars })),
            _ => RpcResponse::ok(Value::Null),
        };
        apply_auth_effects(&self.core, &request, &response);
        Ok(response)
    }
}

/// A client with the `mock` scheme registered, plus its shared behaviour.
pub fn mock_client() -> (Client, Arc<MockBehaviour>) {
    let behaviour = Arc::new(MockBehaviour::default());
    let ctx = EngineContext::new(EngineEmitter::new()).with_settings(ConnectionSettings::default());
    let client = Client::with_context(ctx);
    let shared = behaviour.clone();
    client.register_engine(
        "mock",
        Arc::new(move |ctx: EngineContext| {
            Arc::new(MockEngine {
                core: EngineCore::new(ctx.emitter),
                behaviour: shared.clone(),
            }) as Arc<dyn Engine>
        }),
    );
    (client, behaviour)
}
