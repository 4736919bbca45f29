//! Per-server circuit breakers.
//!
//! # States
//! - Closed: both protocols are checked
//! - Open: server assumed down, checks short-circuit
//! - Half-Open: recovery window elapsed, next check decides
//! - Cap-Only / Rest-Only: one protocol keeps failing, only the other is checked
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_threshold consecutive UNHEALTHY results
//! Open → Half-Open: after recovery timeout (read-time transition)
//! Half-Open → Closed: next result is not UNHEALTHY
//! Half-Open → Open: next result is UNHEALTHY
//! Closed → Cap-Only: failure_threshold consecutive REST failures while capability succeeds
//! Closed → Rest-Only: the mirror case
//! Cap-Only / Rest-Only → Closed: after recovery timeout
//! ```
//!
//! # Design Decisions
//! - Per-server breaker (not global)
//! - The orchestrator only reads; the fleet monitor writes after each cycle
//! - UNKNOWN results carry no signal and are ignored

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::health::types::{DualCheckResult, HealthError, HealthResult, HealthStatus};

/// Breaker state as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
    CapOnly,
    RestOnly,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
            CircuitBreakerState::CapOnly => "cap_only",
            CircuitBreakerState::RestOnly => "rest_only",
        }
    }
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only breaker lookup consumed by the orchestrator.
pub trait CircuitBreakerRegistry: Send + Sync {
    fn state(&self, server_name: &str) -> CircuitBreakerState;
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery: Duration,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery: Duration) -> HealthResult<Self> {
        if failure_threshold == 0 {
            return Err(HealthError::Configuration("breaker failure_threshold must be > 0".into()));
        }
        Ok(Self {
            failure_threshold,
            recovery,
        })
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitBreakerState,
    changed_at: Instant,
    consecutive_failures: u32,
    capability_failures: u32,
    rest_failures: u32,
}

impl BreakerEntry {
    fn closed() -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            changed_at: Instant::now(),
            consecutive_failures: 0,
            capability_failures: 0,
            rest_failures: 0,
        }
    }

    fn effective(&self, recovery: Duration, now: Instant) -> CircuitBreakerState {
        let recovered = now.duration_since(self.changed_at) >= recovery;
        match self.state {
            CircuitBreakerState::Open if recovered => CircuitBreakerState::HalfOpen,
            CircuitBreakerState::CapOnly | CircuitBreakerState::RestOnly if recovered => {
                CircuitBreakerState::Closed
            }
            state => state,
        }
    }

    fn transition(&mut self, state: CircuitBreakerState, now: Instant) {
        self.state = state;
        self.changed_at = now;
        self.capability_failures = 0;
        self.rest_failures = 0;
        if state == CircuitBreakerState::Closed {
            self.consecutive_failures = 0;
        }
    }
}

/// DashMap-backed breaker registry.
#[derive(Debug)]
pub struct BreakerBook {
    config: BreakerConfig,
    entries: DashMap<String, BreakerEntry>,
}

impl BreakerBook {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Fold one check result into the server's breaker.
    pub fn record(&self, result: &DualCheckResult) {
        if result.overall_status == HealthStatus::Unknown {
            return;
        }

        let now = Instant::now();
        let threshold = self.config.failure_threshold;
        let mut entry = self
            .entries
            .entry(result.server_name.clone())
            .or_insert_with(BreakerEntry::closed);

        let before = entry.effective(self.config.recovery, now);
        let unhealthy = result.overall_status == HealthStatus::Unhealthy;

        match before {
            // Produced by the short-circuit itself; nothing new was learned.
            CircuitBreakerState::Open => return,
            CircuitBreakerState::HalfOpen => {
                if unhealthy {
                    entry.transition(CircuitBreakerState::Open, now);
                } else {
                    entry.transition(CircuitBreakerState::Closed, now);
                }
            }
            CircuitBreakerState::Closed
            | CircuitBreakerState::CapOnly
            | CircuitBreakerState::RestOnly => {
                if before != entry.state {
                    // Partial state expired on read; make it explicit.
                    entry.transition(before, now);
                }

                if unhealthy {
                    entry.consecutive_failures += 1;
                } else {
                    entry.consecutive_failures = 0;
                }

                let cap_ok = result.capability_result.as_ref().map(|r| r.success);
                let rest_ok = result.rest_result.as_ref().map(|r| r.success);
                match (cap_ok, rest_ok) {
                    (Some(true), Some(false)) => {
                        entry.rest_failures += 1;
                        entry.capability_failures = 0;
                    }
                    (Some(false), Some(true)) => {
                        entry.capability_failures += 1;
                        entry.rest_failures = 0;
                    }
                    _ => {
                        entry.capability_failures = 0;
                        entry.rest_failures = 0;
                    }
                }

                let was_closed = before == CircuitBreakerState::Closed;
                if entry.consecutive_failures >= threshold {
                    entry.transition(CircuitBreakerState::Open, now);
                } else if was_closed && entry.rest_failures >= threshold {
                    entry.transition(CircuitBreakerState::CapOnly, now);
                } else if was_closed && entry.capability_failures >= threshold {
                    entry.transition(CircuitBreakerState::RestOnly, now);
                }
            }
        }

        if entry.state != before {
            tracing::info!(
                server = %result.server_name,
                from = %before,
                to = %entry.state,
                "Circuit breaker transition"
            );
        }
    }

    /// Manually override a server's breaker.
    pub fn force(&self, server_name: &str, state: CircuitBreakerState) {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(server_name.to_string())
            .or_insert_with(BreakerEntry::closed);
        entry.transition(state, now);
        tracing::warn!(server = %server_name, state = %state, "Circuit breaker forced");
    }

    /// Current state of every tracked server, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitBreakerState)> {
        let now = Instant::now();
        let mut states: Vec<(String, CircuitBreakerState)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().effective(self.config.recovery, now)))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Forget servers no longer configured.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.entries.retain(|name, _| keep(name));
    }
}

impl CircuitBreakerRegistry for BreakerBook {
    fn state(&self, server_name: &str) -> CircuitBreakerState {
        self.entries
            .get(server_name)
            .map(|e| e.effective(self.config.recovery, Instant::now()))
            .unwrap_or(CircuitBreakerState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::types::{ErrorKind, ProbeError, Protocol, ProtocolPayload, ProtocolResult};

    fn probe(protocol: Protocol, ok: bool) -> ProtocolResult {
        if ok {
            ProtocolResult::success("srv", protocol, 10.0, ProtocolPayload::Empty)
        } else {
            let error = ProbeError::new(ErrorKind::Connection, "refused");
            ProtocolResult::failure("srv", protocol, 10.0, error)
        }
    }

    fn result(status: HealthStatus, cap: Option<bool>, rest: Option<bool>) -> DualCheckResult {
        let mut r = DualCheckResult::synthetic("srv", status, "", 10.0);
        r.error = None;
        r.capability_result = cap.map(|ok| probe(Protocol::Capability, ok));
        r.rest_result = rest.map(|ok| probe(Protocol::Rest, ok));
        r
    }

    fn book() -> BreakerBook {
        BreakerBook::new(BreakerConfig::new(2, Duration::from_secs(30)).unwrap())
    }

    #[test]
    fn test_unknown_server_is_closed() {
        assert_eq!(book().state("nobody"), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_consecutive_failures_open() {
        let b = book();
        b.record(&result(HealthStatus::Unhealthy, Some(false), Some(false)));
        assert_eq!(b.state("srv"), CircuitBreakerState::Closed);
        b.record(&result(HealthStatus::Unhealthy, Some(false), Some(false)));
        assert_eq!(b.state("srv"), CircuitBreakerState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = book();
        b.record(&result(HealthStatus::Unhealthy, Some(false), Some(false)));
        b.record(&result(HealthStatus::Healthy, Some(true), Some(true)));
        b.record(&result(HealthStatus::Unhealthy, Some(false), Some(false)));
        assert_eq!(b.state("srv"), CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let b = book();
        b.force("srv", CircuitBreakerState::Open);
        assert_eq!(b.state("srv"), CircuitBreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.state("srv"), CircuitBreakerState::HalfOpen);

        b.record(&result(HealthStatus::Degraded, Some(true), Some(false)));
        assert_eq!(b.state("srv"), CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let b = book();
        b.force("srv", CircuitBreakerState::Open);
        tokio::time::advance(Duration::from_secs(31)).await;

        b.record(&result(HealthStatus::Unhealthy, Some(false), Some(false)));
        assert_eq!(b.state("srv"), CircuitBreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_trips_single_protocol_mode() {
        let b = book();
        b.record(&result(HealthStatus::Degraded, Some(true), Some(false)));
        b.record(&result(HealthStatus::Degraded, Some(true), Some(false)));
        assert_eq!(b.state("srv"), CircuitBreakerState::CapOnly);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.state("srv"), CircuitBreakerState::Closed);

        b.record(&result(HealthStatus::Degraded, Some(false), Some(true)));
        b.record(&result(HealthStatus::Degraded, Some(false), Some(true)));
        assert_eq!(b.state("srv"), CircuitBreakerState::RestOnly);
    }

    #[test]
    fn test_unknown_results_are_ignored() {
        let b = book();
        b.record(&result(HealthStatus::Unhealthy, Some(false), Some(false)));
        b.record(&result(HealthStatus::Unknown, None, None));
        b.record(&result(HealthStatus::Unhealthy, Some(false), Some(false)));
        assert_eq!(b.state("srv"), CircuitBreakerState::Open);
    }

    #[test]
    fn test_snapshot_sorted() {
        let b = book();
        b.force("zeta", CircuitBreakerState::CapOnly);
        b.force("alpha", CircuitBreakerState::Closed);
        let names: Vec<String> = b.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
