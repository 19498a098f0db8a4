//! # sdb-client
//!
//! The user-facing side of the sdb connection runtime.
//!
//! - [`Client`]: resolves a connection string to an engine, serializes
//!   connect and close, dispatches RPC calls and live-query subscriptions
//! - [`AutoReconnect`]: watches the client's errors and reconnects with
//!   exponential backoff
//!
//! Applications call [`init_logging`] once at startup to see the runtime's
//! `tracing` events.

#![deny(unsafe_code)]

pub mod client;
pub mod reconnect;

pub use client::{
    Client, ConnectOptions, EngineEntry, EngineFactory, EngineTable, Target, normalize_endpoint,
};
pub use reconnect::{
    AutoReconnect, ReconnectEmitter, ReconnectEvent, ReconnectPhase, ReconnectState,
    ReconnectStep, ReconnectionInfo, ShouldReconnect, keep_alive_policy,
};

/// Install the stderr subscriber at the configured `logLevel`.
///
/// Reads the process-wide settings, so `SDB_LOG_LEVEL` and the settings
/// file apply; `RUST_LOG` still wins. Later calls are no-ops.
pub fn init_logging() {
    sdb_core::logging::init_subscriber(&sdb_settings::get_settings().log_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_initializes_from_settings_once() {
        init_logging();
        init_logging();
        assert!(!sdb_settings::get_settings().log_level.is_empty());
    }
}
