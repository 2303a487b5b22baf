//! Reconnect delay functions.

use std::sync::Arc;
use std::time::Duration;

/// Maps a 1-based reconnect attempt to the delay before it.
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// `min(base * 2^(attempt-1), max)` milliseconds.
pub fn exponential(base_ms: u64, max_ms: u64) -> Backoff {
    Arc::new(move |attempt| Duration::from_millis(delay_ms(attempt, base_ms, max_ms)))
}

pub fn default_backoff() -> Backoff {
    exponential(DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS)
}

/// Same delay for every attempt.
pub fn constant(delay: Duration) -> Backoff {
    Arc::new(move |_| delay)
}

fn delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(63);
    base_ms
        .checked_mul(1u64 << exponent)
        .map_or(max_ms, |d| d.min(max_ms))
}
