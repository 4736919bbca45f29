//! Timeout enforcement.
//!
//! # Responsibilities
//! - Compute the overall deadline of a dual check
//! - Wrap futures with a deadline, mapping expiry to a distinct error
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; dropping the future cancels it
//! - Timeout errors are distinct from other errors

use std::future::Future;
use std::time::Duration;

use tokio::time;

use crate::health::types::{HealthError, HealthResult};

/// Slack added on top of the slowest enabled protocol timeout.
pub const DEFAULT_TIMEOUT_BUFFER: Duration = Duration::from_secs(5);

/// `max(timeouts) + buffer`; just `buffer` when no timeout is given.
pub fn overall_deadline(
    timeouts: impl IntoIterator<Item = Duration>,
    buffer: Duration,
) -> Duration {
    timeouts.into_iter().max().unwrap_or(Duration::ZERO) + buffer
}

/// Run `fut`, failing with [`HealthError::Timeout`] once `limit` passes.
pub async fn with_timeout<F: Future>(limit: Duration, fut: F) -> HealthResult<F::Output> {
    time::timeout(limit, fut)
        .await
        .map_err(|_| HealthError::Timeout(limit.as_millis() as u64))
}
