//! Backoff delays.

use std::time::Duration;
use rand::Rng;

/// Delay after failed whole-check attempt `attempt` (0-based):
/// `backoff_factor^attempt` seconds, capped at `max_delay`.
pub fn check_retry_delay(attempt: u32, backoff_factor: f64, max_delay: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = backoff_factor.powi(exponent);
    if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
        return max_delay;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

/// Exponential backoff with jitter for re-invoking a single probe.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Jitter: 0 to 10% of the delay
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}
