//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define engine metrics (checks, latency, admission, cache, pools)
//! - Expose Prometheus-compatible metrics endpoint
//! - Produce an on-demand [`MetricsSnapshot`] for the admin API
//!
//! # Metrics
//! - `dual_health_checks_total` (counter): dual checks by status
//! - `dual_health_check_duration_ms` (histogram): combined response time
//! - `dual_health_protocol_results_total` (counter): probes by protocol, outcome
//! - `dual_health_admission_total` (counter): admission decisions
//! - `dual_health_cache_lookups_total` (counter): lookups by category, outcome
//! - `dual_health_pool_utilization` (gauge): in-use fraction per protocol
//! - `dual_health_queue_length` (gauge): pending admission queue
//! - `dual_health_server_score` (gauge): latest health score per server
//!
//! # Design Decisions
//! - Free functions over the `metrics` facade; no-ops until an exporter is installed
//! - Labels are low-cardinality except `server`, bounded by fleet size

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;

use crate::health::types::{DualCheckResult, Protocol, ProtocolResult};
use crate::resources::cache::CacheCategory;

const ROLLING_WINDOW: usize = 100;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter")
        }
    }
}

pub fn record_check(result: &DualCheckResult) {
    metrics::counter!("dual_health_checks_total", "status" => result.overall_status.as_str())
        .increment(1);
    metrics::histogram!("dual_health_check_duration_ms").record(result.combined_response_time_ms);
    metrics::gauge!("dual_health_server_score", "server" => result.server_name.clone())
        .set(result.health_score);
}

pub fn record_protocol_result(result: &ProtocolResult) {
    let outcome = if result.success { "success" } else { "failure" };
    metrics::counter!(
        "dual_health_protocol_results_total",
        "protocol" => result.protocol.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_admission(admitted: bool) {
    let outcome = if admitted { "admitted" } else { "rejected" };
    metrics::counter!("dual_health_admission_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_lookup(category: CacheCategory, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    metrics::counter!(
        "dual_health_cache_lookups_total",
        "category" => category.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_pool_utilization(protocol: Protocol, utilization: f64) {
    metrics::gauge!("dual_health_pool_utilization", "protocol" => protocol.as_str())
        .set(utilization);
}

pub fn record_queue_length(len: usize) {
    metrics::gauge!("dual_health_queue_length").set(len as f64);
}

pub fn record_backoff(server: &str, attempt: u32, delay_ms: u64) {
    tracing::debug!(server = %server, attempt, delay_ms, "Backing off before retry");
    metrics::counter!("dual_health_retries_total").increment(1);
}

/// Read-only view of engine activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_checks: u64,
    pub active_checks: usize,
    pub rolling_avg_response_ms: f64,
    pub cache_hit_rate: f64,
    pub capability_pool_utilization: f64,
    pub rest_pool_utilization: f64,
    pub queue_length: usize,
}

/// Per-engine counters backing [`MetricsSnapshot`].
#[derive(Debug, Default)]
pub struct EngineMetrics {
    total_checks: AtomicU64,
    active_checks: AtomicUsize,
    recent_response_ms: Mutex<VecDeque<f64>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a dual check as in flight until the returned guard drops.
    pub fn start_check(&self) -> ActiveCheck<'_> {
        self.active_checks.fetch_add(1, Ordering::Relaxed);
        ActiveCheck { metrics: self }
    }

    fn record_finished(&self, result: &DualCheckResult) {
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let mut window = self.recent_response_ms.lock().expect("metrics mutex poisoned");
        if window.len() == ROLLING_WINDOW {
            window.pop_front();
        }
        window.push_back(result.combined_response_time_ms);
        drop(window);

        record_check(result);
    }

    pub fn total_checks(&self) -> u64 {
        self.total_checks.load(Ordering::Relaxed)
    }

    pub fn active_checks(&self) -> usize {
        self.active_checks.load(Ordering::Relaxed)
    }

    /// Mean of the last 100 combined response times.
    pub fn rolling_avg_response_ms(&self) -> f64 {
        let window = self.recent_response_ms.lock().expect("metrics mutex poisoned");
        if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f64>() / window.len() as f64
        }
    }

    /// Build a snapshot; the resource-level fields come from their owners.
    pub fn snapshot(
        &self,
        cache_hit_rate: f64,
        capability_pool_utilization: f64,
        rest_pool_utilization: f64,
        queue_length: usize,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            total_checks: self.total_checks(),
            active_checks: self.active_checks(),
            rolling_avg_response_ms: self.rolling_avg_response_ms(),
            cache_hit_rate,
            capability_pool_utilization,
            rest_pool_utilization,
            queue_length,
        }
    }
}

/// In-flight marker returned by [`EngineMetrics::start_check`].
pub struct ActiveCheck<'a> {
    metrics: &'a EngineMetrics,
}

impl ActiveCheck<'_> {
    /// Count `result` as a completed check.
    pub fn finish(self, result: &DualCheckResult) {
        self.metrics.record_finished(result);
    }
}

impl Drop for ActiveCheck<'_> {
    fn drop(&mut self) {
        self.metrics.active_checks.fetch_sub(1, Ordering::Relaxed);
    }
}
