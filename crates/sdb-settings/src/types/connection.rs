//! Transport settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Keep-alive and HTTP body handling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Interval between WebSocket keep-alive pings, in milliseconds.
    pub ping_interval_ms: u64,
    /// How long a single ping may take, in milliseconds.
    pub ping_timeout_ms: u64,
    /// HTTP responses declaring a larger body (or none) are stream-decoded.
    pub http_stream_threshold_bytes: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 30_000,
            ping_timeout_ms: 10_000,
            http_stream_threshold_bytes: 1024 * 1024,
        }
    }
}

impl ConnectionSettings {
    /// Keep-alive interval.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Per-ping timeout.
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}
