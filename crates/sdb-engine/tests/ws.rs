//! WebSocket engine against an in-process tokio-tungstenite server.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sdb_core::{ConnectionState, Error, LiveAction, RpcMethod, RpcRequest, SessionValue};
use sdb_engine::{Channel, Engine, EngineContext, EngineEmitter, Event, WsEngine};
use sdb_settings::ConnectionSettings;
use sdb_tasks::listener;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Fake server ──

enum Reply {
    Send(Value),
    Raw(String),
    Close(u16),
}

type Handler = Arc<dyn Fn(&Value) -> Vec<Reply> + Send + Sync>;

/// Serve every accepted socket with `handler`; returns the `ws://` endpoint.
async fn serve(handler: Handler) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let handler = handler.clone();
            drop(tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    for reply in handler(&request) {
                        let outgoing = match reply {
                            Reply::Send(value) => Message::Text(value.to_string().into()),
                            Reply::Raw(raw) => Message::Text(raw.into()),
                            Reply::Close(code) => Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: String::from("server going away").into(),
                            })),
                        };
                        if ws.send(outgoing).await.is_err() {
                            return;
                        }
                    }
                }
            }));
        }
    }));
    Url::parse(&format!("ws://{addr}/rpc")).unwrap()
}

/// Accept sockets and close each one with `code` right after the handshake.
async fn serve_closing(code: u16) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            drop(tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: String::from("restarting").into(),
                };
                if ws.send(Message::Close(Some(frame))).await.is_err() {
                    return;
                }
                while let Some(Ok(_)) = ws.next().await {}
            }));
        }
    }));
    Url::parse(&format!("ws://{addr}/rpc")).unwrap()
}

fn method(request: &Value) -> &str {
    request["method"].as_str().unwrap_or_default()
}

fn reply(request: &Value, result: Value) -> Reply {
    Reply::Send(json!({ "id": request["id"], "result": result }))
}

/// Replies `null` to everything.
fn echo_null() -> Handler {
    Arc::new(|request: &Value| vec![reply(request, Value::Null)])
}

fn engine_with(settings: ConnectionSettings) -> (WsEngine, EngineEmitter) {
    let emitter = EngineEmitter::new();
    let ctx = EngineContext::new(emitter.clone()).with_settings(settings);
    (WsEngine::new(ctx), emitter)
}

fn engine() -> (WsEngine, EngineEmitter) {
    engine_with(ConnectionSettings::default())
}

fn record_states(emitter: &EngineEmitter) -> Arc<Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for state in [
        ConnectionState::Connecting,
        ConnectionState::Open,
        ConnectionState::Closing,
        ConnectionState::Closed,
    ] {
        let sink = seen.clone();
        let _ = emitter.on(
            Channel::State(state),
            listener(move |_: Event| {
                sink.lock().push(state);
                async { Ok(()) }
            }),
        );
    }
    seen
}

// ── Lifecycle ──

#[tokio::test]
async fn connect_ping_disconnect_cycle() {
    let url = serve(echo_null()).await;
    let (ws, emitter) = engine();
    let states = record_states(&emitter);

    ws.connect(url.clone()).await.unwrap();
    assert_eq!(ws.connection().state, ConnectionState::Open);
    assert_eq!(ws.connection().endpoint, Some(url.clone()));

    let response = ws.rpc(RpcRequest::ping(), None).await.unwrap();
    assert_eq!(response.result, Ok(Value::Null));
    assert!(response.id.unwrap().starts_with("ping_"));

    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
    assert_eq!(ws.connection().state, ConnectionState::Closed);
    assert_eq!(
        *states.lock(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ]
    );

    // A closed engine can connect again.
    ws.connect(url).await.unwrap();
    assert_eq!(ws.connection().state, ConnectionState::Open);
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn connect_when_open_and_disconnect_when_closed_are_noops() {
    let url = serve(echo_null()).await;
    let (ws, emitter) = engine();
    ws.disconnect().await.unwrap();

    ws.connect(url.clone()).await.unwrap();
    let states = record_states(&emitter);
    ws.connect(url).await.unwrap();
    assert!(states.lock().is_empty());
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_endpoint_fails_fatally_and_stays_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (ws, emitter) = engine();
    let states = record_states(&emitter);
    let err = ws
        .connect(Url::parse(&format!("ws://{addr}/rpc")).unwrap())
        .await
        .unwrap_err();
    assert_matches!(err, Error::Socket { code: 3150, fatal: true, .. });
    assert_eq!(ws.connection().state, ConnectionState::Closed);
    assert_eq!(*states.lock(), vec![ConnectionState::Connecting]);
}

#[tokio::test]
async fn vetoed_open_reports_3151_and_closes() {
    let url = serve(echo_null()).await;
    let (ws, emitter) = engine();
    let _ = emitter.on(
        Channel::State(ConnectionState::Open),
        listener(|_: Event| async { Err(Error::aborted("not allowed")) }),
    );
    let reported = emitter.once(Channel::Error, None);

    let err = timeout(TIMEOUT, ws.connect(url)).await.unwrap().unwrap_err();
    assert_matches!(err, Error::StateTransition { to: ConnectionState::Open, .. });
    assert_eq!(ws.connection().state, ConnectionState::Closed);

    let event = timeout(TIMEOUT, reported.wait()).await.unwrap().unwrap();
    assert_matches!(event, Event::Error(Error::Socket { code: 3151, fatal: true, .. }));
}

#[tokio::test]
async fn peer_close_during_a_vetoed_open_ends_closed() {
    let closing = serve_closing(1000).await;
    let (ws, emitter) = engine();
    let slow_veto = emitter.on(
        Channel::State(ConnectionState::Open),
        listener(|_: Event| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Err(Error::aborted("not allowed"))
        }),
    );

    let err = timeout(TIMEOUT, ws.connect(closing)).await.unwrap().unwrap_err();
    assert_matches!(
        err,
        Error::StateTransition {
            to: ConnectionState::Open,
            fallback: ConnectionState::Closed,
            ..
        }
    );
    assert_eq!(ws.connection().state, ConnectionState::Closed);

    // The engine is reusable once the veto is lifted.
    assert!(emitter.off(&Channel::State(ConnectionState::Open), &slow_veto));
    let url = serve(echo_null()).await;
    timeout(TIMEOUT, ws.connect(url)).await.unwrap().unwrap();
    assert_eq!(ws.connection().state, ConnectionState::Open);
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn rpc_requires_an_open_socket() {
    let (ws, _) = engine();
    let err = ws.rpc(RpcRequest::ping(), None).await.unwrap_err();
    assert_matches!(err, Error::ConnectionUnavailable { .. });
}

// ── Correlation ──

#[tokio::test]
async fn concurrent_replies_route_by_id() {
    let seen_ids = Arc::new(Mutex::new(Vec::new()));
    let ids = seen_ids.clone();
    let url = serve(Arc::new(move |request: &Value| {
        ids.lock().push(request["id"].as_str().unwrap_or_default().to_owned());
        // Echo the query text back as the result.
        vec![reply(request, request["params"][0].clone())]
    }))
    .await;
    let (ws, _) = engine();
    ws.connect(url).await.unwrap();

    let (a, b) = tokio::join!(
        ws.rpc(RpcRequest::query("SELECT 1", serde_json::Map::new()), None),
        ws.rpc(RpcRequest::query("SELECT 2", serde_json::Map::new()), None),
    );
    assert_eq!(a.unwrap().result, Ok(json!("SELECT 1")));
    assert_eq!(b.unwrap().result, Ok(json!("SELECT 2")));

    let ids = seen_ids.lock().clone();
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.starts_with("query_")));
    assert_ne!(ids[0], ids[1]);
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn server_error_body_is_returned_not_raised() {
    let url = serve(Arc::new(|request: &Value| {
        vec![Reply::Send(json!({
            "id": request["id"],
            "error": { "code": -32000, "message": "there was a problem" }
        }))]
    }))
    .await;
    let (ws, _) = engine();
    ws.connect(url).await.unwrap();

    let response = ws
        .rpc(RpcRequest::query("THROW 'x'", serde_json::Map::new()), None)
        .await
        .unwrap();
    let body = response.result.unwrap_err();
    assert_eq!(body.code, -32000);
    assert_eq!(body.message, "there was a problem");
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn live_push_is_routed_by_query_id() {
    let url = serve(Arc::new(|request: &Value| {
        if method(request) == "live" {
            vec![
                reply(request, json!("q1")),
                Reply::Send(json!({
                    "result": { "id": "q1", "action": "CREATE", "result": { "name": "tobie" } }
                })),
            ]
        } else {
            vec![reply(request, Value::Null)]
        }
    }))
    .await;
    let (ws, emitter) = engine();
    let pushed = emitter.once(Channel::Live("q1".into()), None);
    ws.connect(url).await.unwrap();

    let response = ws
        .rpc(
            RpcRequest::from_parts(RpcMethod::Live, vec![json!("person")]).unwrap(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(response.result, Ok(json!("q1")));

    let event = timeout(TIMEOUT, pushed.wait()).await.unwrap().unwrap();
    let Event::Live(message) = event else {
        panic!("expected a live event, got {event:?}");
    };
    assert_eq!(message.query_id, "q1");
    assert_eq!(message.action, LiveAction::Create);
    assert_eq!(message.result, json!({ "name": "tobie" }));
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn undecodable_frame_is_non_fatal() {
    let url = serve(Arc::new(|request: &Value| {
        vec![Reply::Raw("{not json".into()), reply(request, json!("pong"))]
    }))
    .await;
    let (ws, emitter) = engine();
    let reported = emitter.once(Channel::Error, None);
    ws.connect(url).await.unwrap();

    let response = ws.rpc(RpcRequest::ping(), None).await.unwrap();
    assert_eq!(response.result, Ok(json!("pong")));

    let event = timeout(TIMEOUT, reported.wait()).await.unwrap().unwrap();
    assert_matches!(event, Event::Error(Error::Socket { code: 3152, fatal: false, .. }));
    assert_eq!(ws.connection().state, ConnectionState::Open);
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn unrecognised_frame_is_reported_without_closing() {
    let url = serve(Arc::new(|request: &Value| {
        vec![
            Reply::Raw(r#"{"hello":"world"}"#.into()),
            reply(request, json!("pong")),
        ]
    }))
    .await;
    let (ws, emitter) = engine();
    let reported = emitter.once(Channel::Error, None);
    ws.connect(url).await.unwrap();

    let response = ws.rpc(RpcRequest::ping(), None).await.unwrap();
    assert_eq!(response.result, Ok(json!("pong")));

    let event = timeout(TIMEOUT, reported.wait()).await.unwrap().unwrap();
    assert_matches!(event, Event::Error(ref error @ Error::MalformedResponse { .. }) => {
        assert!(!error.is_fatal());
    });
    assert_eq!(ws.connection().state, ConnectionState::Open);
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn caller_signal_aborts_a_pending_rpc() {
    // Never answers queries.
    let url = serve(Arc::new(|request: &Value| {
        if method(request) == "query" {
            Vec::new()
        } else {
            vec![reply(request, Value::Null)]
        }
    }))
    .await;
    let (ws, _) = engine();
    ws.connect(url).await.unwrap();

    let signal = sdb_tasks::AbortSignal::timeout(Duration::from_millis(50));
    let err = timeout(
        TIMEOUT,
        ws.rpc(RpcRequest::query("SLEEP 1h", serde_json::Map::new()), Some(signal)),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_matches!(err, Error::Timeout { after_ms: 50 });

    // The socket is still usable.
    assert!(ws.rpc(RpcRequest::ping(), None).await.is_ok());
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

// ── Unsolicited close ──

#[tokio::test]
async fn abnormal_close_fails_pending_rpc_and_walks_to_closed() {
    let url = serve(Arc::new(|request: &Value| {
        if method(request) == "query" {
            vec![Reply::Close(1011)]
        } else {
            vec![reply(request, Value::Null)]
        }
    }))
    .await;
    let (ws, emitter) = engine();
    ws.connect(url).await.unwrap();
    let states = record_states(&emitter);
    let reported = emitter.once(Channel::Error, None);
    let closed = emitter.once(Channel::State(ConnectionState::Closed), None);

    let err = timeout(
        TIMEOUT,
        ws.rpc(RpcRequest::query("BREAK", serde_json::Map::new()), None),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert_matches!(err, Error::Socket { code: 1011, .. });

    let event = timeout(TIMEOUT, reported.wait()).await.unwrap().unwrap();
    assert_matches!(event, Event::Error(Error::Socket { code: 1011, fatal: false, .. }));

    let _ = timeout(TIMEOUT, closed.wait()).await.unwrap().unwrap();
    emitter.idle().await.unwrap();
    assert_eq!(
        *states.lock(),
        vec![ConnectionState::Closing, ConnectionState::Closed]
    );
    assert_eq!(ws.connection(), sdb_engine::ConnectionInfo::default());
}

#[tokio::test]
async fn normal_close_is_swallowed() {
    let url = serve(Arc::new(|request: &Value| {
        if method(request) == "query" {
            vec![Reply::Close(1000)]
        } else {
            vec![reply(request, Value::Null)]
        }
    }))
    .await;
    let (ws, emitter) = engine();
    ws.connect(url).await.unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let _ = emitter.on(
        Channel::Error,
        listener(move |event: Event| {
            sink.lock().push(event);
            async { Ok(()) }
        }),
    );
    let closed = emitter.once(Channel::State(ConnectionState::Closed), None);

    let _ = ws
        .rpc(RpcRequest::query("BYE", serde_json::Map::new()), None)
        .await;
    let _ = timeout(TIMEOUT, closed.wait()).await.unwrap().unwrap();
    emitter.idle().await.unwrap();
    assert!(errors.lock().is_empty());
}

// ── Session ──

#[tokio::test]
async fn use_keeps_the_unspecified_selector() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sink = sent.clone();
    let url = serve(Arc::new(move |request: &Value| {
        if method(request) == "use" {
            sink.lock().push(request["params"].clone());
        }
        vec![reply(request, Value::Null)]
    }))
    .await;
    let (ws, _) = engine();
    ws.connect(url).await.unwrap();

    let _ = ws
        .rpc(
            RpcRequest::use_ns_db(SessionValue::Set("ns".into()), SessionValue::Set("db".into())),
            None,
        )
        .await
        .unwrap();
    let _ = ws
        .rpc(
            RpcRequest::use_ns_db(SessionValue::Set("other".into()), SessionValue::Keep),
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        *sent.lock(),
        vec![json!(["ns", "db"]), json!(["other", "db"])]
    );
    let info = ws.connection();
    assert_eq!(info.namespace.as_deref(), Some("other"));
    assert_eq!(info.database.as_deref(), Some("db"));

    let _ = ws
        .rpc(
            RpcRequest::use_ns_db(SessionValue::Clear, SessionValue::Clear),
            None,
        )
        .await
        .unwrap();
    assert!(ws.connection().namespace.is_none());
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn overlapping_use_calls_raise_a_conflict() {
    // The first `use` is answered only after the second one arrives.
    let held = Arc::new(Mutex::new(None::<Value>));
    let url = serve(Arc::new(move |request: &Value| {
        if method(request) != "use" {
            return vec![reply(request, Value::Null)];
        }
        let mut held = held.lock();
        match held.take() {
            None => {
                *held = Some(request.clone());
                Vec::new()
            }
            Some(first) => vec![reply(request, Value::Null), reply(&first, Value::Null)],
        }
    }))
    .await;
    let (ws, _) = engine();
    ws.connect(url).await.unwrap();

    let select = |ns: &str, db: &str| {
        RpcRequest::use_ns_db(SessionValue::Set(ns.into()), SessionValue::Set(db.into()))
    };
    let (first, second) = timeout(TIMEOUT, async {
        tokio::join!(ws.rpc(select("a", "x"), None), ws.rpc(select("b", "y"), None))
    })
    .await
    .unwrap();

    // Whichever reply is applied first wins; the other reports the race
    // and leaves that selection in place.
    let info = ws.connection();
    let kept = (info.namespace.clone().unwrap(), info.database.clone().unwrap());
    let (conflict, winner) = match (first, second) {
        (Err(e), Ok(_)) => (e, ("b".to_owned(), "y".to_owned())),
        (Ok(_), Err(e)) => (e, ("a".to_owned(), "x".to_owned())),
        other => panic!("expected exactly one conflict, got {other:?}"),
    };
    assert_eq!(kept, winner);
    assert_matches!(
        conflict,
        Error::UseConflict {
            expected_namespace: None,
            expected_database: None,
            actual_namespace: Some(ref ns),
            actual_database: Some(ref db),
        } if (ns.clone(), db.clone()) == winner
    );
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn use_database_without_namespace_is_rejected_locally() {
    let calls = Arc::new(Mutex::new(0_usize));
    let counter = calls.clone();
    let url = serve(Arc::new(move |request: &Value| {
        if method(request) == "use" {
            *counter.lock() += 1;
        }
        vec![reply(request, Value::Null)]
    }))
    .await;
    let (ws, _) = engine();
    ws.connect(url).await.unwrap();

    let err = ws
        .rpc(
            RpcRequest::use_ns_db(SessionValue::Keep, SessionValue::Set("db".into())),
            None,
        )
        .await
        .unwrap_err();
    assert_matches!(err, Error::MissingNamespace);
    assert_eq!(*calls.lock(), 0);
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

#[tokio::test]
async fn signin_stores_and_invalidate_clears_the_token() {
    let url = serve(Arc::new(|request: &Value| match method(request) {
        "signin" => vec![reply(request, json!("jwt-token"))],
        _ => vec![reply(request, Value::Null)],
    }))
    .await;
    let (ws, _) = engine();
    ws.connect(url).await.unwrap();

    let signin = RpcRequest::from_parts(
        RpcMethod::Signin,
        vec![json!({ "user": "root", "pass": "root" })],
    )
    .unwrap();
    let _ = ws.rpc(signin, None).await.unwrap();
    assert_eq!(ws.connection().token.as_deref(), Some("jwt-token"));

    let invalidate = RpcRequest::from_parts(RpcMethod::Invalidate, Vec::new()).unwrap();
    let _ = ws.rpc(invalidate, None).await.unwrap();
    assert!(ws.connection().token.is_none());
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}

// ── Keep-alive ──

#[tokio::test]
async fn unanswered_ping_reports_keep_alive_failure() {
    // Answers everything except pings.
    let url = serve(Arc::new(|request: &Value| {
        if method(request) == "ping" {
            Vec::new()
        } else {
            vec![reply(request, Value::Null)]
        }
    }))
    .await;
    let settings = ConnectionSettings {
        ping_interval_ms: 20,
        ping_timeout_ms: 30,
        ..ConnectionSettings::default()
    };
    let (ws, emitter) = engine_with(settings);
    let reported = emitter.once(Channel::Error, None);
    ws.connect(url).await.unwrap();

    let event = timeout(TIMEOUT, reported.wait()).await.unwrap().unwrap();
    let Event::Error(error) = event else {
        panic!("expected an error event, got {event:?}");
    };
    assert!(error.is_keep_alive_failure());
    assert_eq!(ws.connection().state, ConnectionState::Open);
    timeout(TIMEOUT, ws.disconnect()).await.unwrap().unwrap();
}
