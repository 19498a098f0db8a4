//! # sdb-core
//!
//! Shared vocabulary for the sdb connection runtime.
//!
//! - **Errors**: [`Error`] taxonomy via `thiserror`, with [`RequestContext`]
//!   attached to transport and RPC failures
//! - **Connection state**: the four-valued [`ConnectionState`] cycle
//! - **RPC wire types**: [`RpcMethod`] catalogue, [`RpcRequest`], [`RpcResponse`],
//!   live-query push frames
//! - **Formatter**: the codec seam ([`Formatter`]) plus a JSON implementation
//! - **Retry**: exponential backoff math used by the reconnect supervisor
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod errors;
pub mod formatter;
pub mod logging;
pub mod retry;
pub mod rpc;
pub mod state;

pub use errors::{Error, ErrorCategory, RequestContext, Result};
pub use formatter::{Formatter, JsonFormatter};
pub use rpc::{
    Inbound, LiveAction, LiveMessage, RpcErrorBody, RpcMethod, RpcRequest, RpcResponse,
    SessionValue,
};
pub use state::ConnectionState;
