//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may set any subset of fields; missing fields keep their defaults.

mod connection;
mod reconnect;

pub use connection::*;
pub use reconnect::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "connection": { "pingIntervalMs": 15000 },
///   "reconnect": { "maxDelayMs": 10000 },
///   "logLevel": "info"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SdbSettings {
    /// Transport tuning.
    pub connection: ConnectionSettings,
    /// Auto-reconnect policy.
    pub reconnect: ReconnectSettings,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for SdbSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            reconnect: ReconnectSettings::default(),
            log_level: "warn".to_string(),
        }
    }
}
