//! # sdb-engine
//!
//! Transport engines for the sdb connection runtime.
//!
//! Every engine drives the same four-state machine
//! (`CLOSED → CONNECTING → OPEN → CLOSING → CLOSED`) held in an
//! [`EngineCore`], publishing each transition on a shared [`EngineEmitter`].
//! A listener that fails a transition vetoes it and the core rolls back.
//!
//! - [`HttpEngine`]: stateless POST per call, session state kept locally
//! - [`WsEngine`]: one persistent socket, id-correlated replies, live-query
//!   pushes and a keep-alive loop

#![deny(unsafe_code)]

pub mod connection;
pub mod engine;
pub mod http;
pub mod ws;

pub use connection::{Channel, ConnectionInfo, EngineContext, EngineEmitter, Event};
pub use engine::{Engine, EngineCore};
pub use http::HttpEngine;
pub use ws::WsEngine;
