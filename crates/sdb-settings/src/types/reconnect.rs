//! Auto-reconnect policy settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff and trigger policy for the reconnect supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Whether the supervisor reacts to errors at all.
    pub enabled: bool,
    /// Delay before the first attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for the doubled delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Keep-alive failures needed inside the window to trigger a reconnect.
    pub failure_threshold: usize,
    /// Rolling window for counting keep-alive failures, in milliseconds.
    pub failure_window_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            failure_threshold: 3,
            failure_window_ms: 60_000,
        }
    }
}

impl ReconnectSettings {
    /// First backoff delay.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Backoff ceiling.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Failure counting window.
    #[must_use]
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}
