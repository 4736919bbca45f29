//! Periodic fleet checking.
//!
//! # Responsibilities
//! - Run `check_fleet` over the configured targets on a fixed interval
//! - Feed results into the breaker book and the `check_results` cache
//! - Execute batches handed over by the batch scheduler
//! - Swap the target list when the configuration is reloaded

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::config::schema::HealthConfig;
use crate::health::orchestrator::DualCheckOrchestrator;
use crate::health::types::{DualCheckResult, HealthStatus, ServerTarget};
use crate::resilience::circuit_breaker::BreakerBook;
use crate::resources::cache::{CacheCategory, CachedValue};
use crate::scheduler::batch::Batch;

/// Per-cycle roll-up of a fleet check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub mean_score: f64,
    pub mean_response_ms: f64,
}

impl FleetSummary {
    pub fn from_results(results: &[DualCheckResult]) -> Self {
        let mut summary = FleetSummary {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.overall_status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }
        if !results.is_empty() {
            let n = results.len() as f64;
            summary.mean_score = results.iter().map(|r| r.health_score).sum::<f64>() / n;
            summary.mean_response_ms =
                results.iter().map(|r| r.combined_response_time_ms).sum::<f64>() / n;
        }
        summary
    }
}

/// Drives periodic fleet checks.
pub struct FleetMonitor {
    orchestrator: Arc<DualCheckOrchestrator>,
    breakers: Arc<BreakerBook>,
    targets: ArcSwap<Vec<ServerTarget>>,
    interval: Duration,
}

impl FleetMonitor {
    pub fn new(
        orchestrator: Arc<DualCheckOrchestrator>,
        breakers: Arc<BreakerBook>,
        targets: Vec<ServerTarget>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            breakers,
            targets: ArcSwap::from_pointee(targets),
            interval,
        }
    }

    pub fn orchestrator(&self) -> &Arc<DualCheckOrchestrator> {
        &self.orchestrator
    }

    pub fn breakers(&self) -> &Arc<BreakerBook> {
        &self.breakers
    }

    /// Current target list.
    pub fn targets(&self) -> Arc<Vec<ServerTarget>> {
        self.targets.load_full()
    }

    pub fn target(&self, name: &str) -> Option<ServerTarget> {
        self.targets.load().iter().find(|t| t.name() == name).cloned()
    }

    /// Atomically replace the target list; breakers of removed servers are dropped.
    pub fn replace_targets(&self, targets: Vec<ServerTarget>) {
        let names: Vec<String> = targets.iter().map(|t| t.name().to_string()).collect();
        self.breakers.retain(|name| names.iter().any(|n| n == name));
        tracing::info!(servers = targets.len(), "Fleet target list replaced");
        self.targets.store(Arc::new(targets));
    }

    /// Latest cached result of a server.
    pub fn latest(&self, name: &str) -> Option<DualCheckResult> {
        match self.orchestrator.collaborators().cache.get(CacheCategory::CheckResults, name) {
            Some(CachedValue::CheckResult(result)) => Some(*result),
            _ => None,
        }
    }

    /// Store results and update breakers.
    pub fn record(&self, results: &[DualCheckResult]) {
        let cache = &self.orchestrator.collaborators().cache;
        for result in results {
            self.breakers.record(result);
            cache.set(
                CacheCategory::CheckResults,
                result.server_name.clone(),
                CachedValue::CheckResult(Box::new(result.clone())),
                None,
            );
        }
    }

    /// One full pass over the fleet.
    pub async fn run_cycle(&self) -> FleetSummary {
        let targets = self.targets();
        let results = self.orchestrator.check_fleet(&targets, None).await;
        self.record(&results);

        let summary = FleetSummary::from_results(&results);
        tracing::info!(
            total = summary.total,
            healthy = summary.healthy,
            degraded = summary.degraded,
            unhealthy = summary.unhealthy,
            unknown = summary.unknown,
            mean_score = summary.mean_score,
            mean_response_ms = summary.mean_response_ms,
            "Fleet cycle complete"
        );
        summary
    }

    /// Check the fleet every interval until shutdown, applying config reloads.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        mut updates: mpsc::UnboundedReceiver<HealthConfig>,
    ) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Fleet monitor starting");
        let mut ticker = time::interval(self.interval);
        let mut updates_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.run_cycle() => {}
                        _ = shutdown.recv() => {
                            tracing::info!("Fleet monitor shut down mid-cycle, exiting loop");
                            break;
                        }
                    }
                }
                update = updates.recv(), if updates_open => match update {
                    Some(config) => match config.server_targets() {
                        Ok(targets) => self.replace_targets(targets),
                        Err(e) => tracing::error!(error = %e, "Reloaded server list rejected"),
                    },
                    None => updates_open = false,
                },
                _ = shutdown.recv() => {
                    tracing::info!("Fleet monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Execute batches from the scheduler until the channel closes.
pub async fn run_batch_consumer(monitor: Arc<FleetMonitor>, mut batches: mpsc::Receiver<Batch>) {
    while let Some(batch) = batches.recv().await {
        tracing::debug!(
            batch_id = %batch.id,
            priority = batch.priority,
            size = batch.len(),
            "Executing batch"
        );
        let results = monitor.orchestrator.check_fleet(&batch.targets, None).await;
        monitor.record(&results);
    }
    tracing::info!("Batch consumer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: HealthStatus, score: f64, ms: f64) -> DualCheckResult {
        let mut r = DualCheckResult::synthetic("srv", status, "", ms);
        r.health_score = score;
        r
    }

    #[test]
    fn test_summary_counts_and_means() {
        let summary = FleetSummary::from_results(&[
            result(HealthStatus::Healthy, 1.0, 40.0),
            result(HealthStatus::Degraded, 0.6, 60.0),
            result(HealthStatus::Unhealthy, 0.0, 20.0),
            result(HealthStatus::Unknown, 0.0, 0.0),
        ]);
        assert_eq!(summary.total, 4);
        let counts = (summary.healthy, summary.degraded, summary.unhealthy, summary.unknown);
        assert_eq!(counts, (1, 1, 1, 1));
        assert!((summary.mean_score - 0.4).abs() < 1e-9);
        assert!((summary.mean_response_ms - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(FleetSummary::from_results(&[]), FleetSummary::default());
    }
}
