//! Exponential backoff math for reconnection.
//!
//! Formula: `min(initial_delay * 2^attempt, max_delay)`. Jitter-free so that
//! the schedule is reproducible: `500, 1000, 2000, ...` for a 500 ms initial
//! delay.

use std::time::Duration;

/// Default initial reconnect delay in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;
/// Default maximum reconnect delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Delay in milliseconds before reconnection attempt `attempt` (zero-based).
#[must_use]
pub fn backoff_delay_ms(attempt: u32, initial_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponential = initial_delay_ms.saturating_mul(1u64 << attempt.min(31));
    exponential.min(max_delay_ms)
}

/// [`backoff_delay_ms`] as a [`Duration`].
#[must_use]
pub fn backoff_delay(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
    #[allow(clippy::cast_possible_truncation)]
    let ms = backoff_delay_ms(
        attempt,
        initial_delay.as_millis() as u64,
        max_delay.as_millis() as u64,
    );
    Duration::from_millis(ms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
