//! Retry logic.
//!
//! # Responsibilities
//! - Whole-check retry policy (attempt count, exponential delay)
//! - Re-invoke a single protocol probe on transient failure
//!
//! # Design Decisions
//! - Only connection and timeout failures are re-invoked at probe level;
//!   protocol and HTTP errors are answers, not transients
//! - Jittered backoff between probe attempts prevents thundering herd
//! - A probe retry loop runs inside the overall deadline and is cancelled with it

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time;

use crate::health::types::{HealthError, HealthResult, ProtocolResult};
use crate::resilience::backoff::{calculate_backoff, check_retry_delay};

const PROBE_RETRY_BASE_MS: u64 = 100;
const PROBE_RETRY_MAX_MS: u64 = 2_000;

/// Policy for retrying a whole dual check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    #[serde(skip)]
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: f64, max_delay: Duration) -> HealthResult<Self> {
        if !(backoff_factor.is_finite() && backoff_factor > 0.0) {
            return Err(HealthError::Configuration(format!(
                "backoff_factor must be a positive number (got {backoff_factor})"
            )));
        }
        Ok(Self {
            max_retries,
            backoff_factor,
            max_delay,
        })
    }

    /// Total attempts; at least one.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Sleep after failed attempt `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        check_retry_delay(attempt, self.backoff_factor, self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Invoke a probe, re-invoking up to `retries` extra times while it fails
/// with a connection or timeout error.
pub async fn retry_probe<F, Fut>(retries: u32, mut invoke: F) -> ProtocolResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProtocolResult>,
{
    let mut attempt = 0;
    loop {
        let result = invoke().await;
        if result.success || !result.is_retryable() || attempt >= retries {
            return result;
        }
        attempt += 1;
        let delay = calculate_backoff(attempt, PROBE_RETRY_BASE_MS, PROBE_RETRY_MAX_MS);
        tracing::debug!(
            server = %result.server_name,
            protocol = %result.protocol,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Re-invoking probe after transient failure"
        );
        time::sleep(delay).await;
    }
}
