//! Dual-protocol check orchestration.
//!
//! # Responsibilities
//! - Run one server's capability and REST probes concurrently under a deadline
//! - Retry whole checks with exponential backoff
//! - Fan checks out across a fleet, preserving input order
//! - Cancel in-flight checks per server or globally
//!
//! # Concurrency layers
//! ```text
//! check_fleet ── fleet semaphore (servers in parallel)
//!     └─ check_server ── breaker OPEN? → synthetic, no load
//!            ├─ ResourceMonitor admission (memory/CPU, global ceiling)
//!            └─ dispatch semaphore (dual dispatches in flight)
//!                   ├─ capability subtask ─┐
//!                   └─ REST subtask ───────┴─ deadline = max(timeouts) + buffer
//! ```
//!
//! # Design Decisions
//! - Expected failures are data; only admission rejection surfaces as an error
//! - Cancellation is scoped with child tokens: root → server → check
//! - Breaker state is read, never written, here

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::health::aggregator::{combine, AggregationConfig};
use crate::health::types::{
    DualCheckResult, ErrorKind, HealthError, HealthResult, HealthStatus, ProbeError, Protocol,
    ProtocolResult, ServerTarget,
};
use crate::observability::metrics::{self, EngineMetrics, MetricsSnapshot};
use crate::protocol::{AuthProvider, ProbeClient};
use crate::resilience::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerState};
use crate::resilience::retries::{retry_probe, RetryPolicy};
use crate::resilience::timeouts::{overall_deadline, with_timeout, DEFAULT_TIMEOUT_BUFFER};
use crate::resources::admission::ResourceMonitor;
use crate::resources::cache::CacheManager;
use crate::resources::pool::ConnectionPoolManager;

pub const BREAKER_OPEN: &str = "circuit breaker open";
pub const CHECK_TIMEOUT: &str = "health check timeout";
pub const RESOURCE_EXHAUSTED: &str = "resource exhausted";
pub const CHECK_CANCELLED: &str = "check cancelled";

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Dual dispatches allowed in flight at once.
    pub dispatch_concurrency: usize,
    /// Servers checked in parallel by one `check_fleet` call.
    pub fleet_concurrency: usize,
    /// Added to the slowest enabled protocol timeout.
    pub timeout_buffer: Duration,
    /// How long a fleet member waits in the admission queue.
    pub queue_wait_timeout: Duration,
    pub aggregation: AggregationConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> HealthResult<()> {
        if self.dispatch_concurrency == 0 || self.fleet_concurrency == 0 {
            return Err(HealthError::Configuration(
                "dispatch_concurrency and fleet_concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: 10,
            fleet_concurrency: 20,
            timeout_buffer: DEFAULT_TIMEOUT_BUFFER,
            queue_wait_timeout: Duration::from_secs(30),
            aggregation: AggregationConfig::default(),
        }
    }
}

/// Everything the orchestrator talks to. Injected, never global.
#[derive(Clone)]
pub struct Collaborators {
    pub capability_client: Arc<dyn ProbeClient>,
    pub rest_client: Arc<dyn ProbeClient>,
    pub auth: Arc<dyn AuthProvider>,
    pub breakers: Arc<dyn CircuitBreakerRegistry>,
    pub pools: Arc<ConnectionPoolManager>,
    pub resources: Arc<ResourceMonitor>,
    pub cache: Arc<CacheManager>,
    pub metrics: Arc<EngineMetrics>,
}

struct ServerScope {
    generation: u64,
    token: CancellationToken,
    active: usize,
}

struct TaskRegistry {
    root: CancellationToken,
    servers: HashMap<String, ServerScope>,
}

/// Registration of one in-flight check; unregisters on drop.
struct ScopeGuard<'a> {
    registry: &'a Mutex<TaskRegistry>,
    server: String,
    generation: u64,
    token: CancellationToken,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().expect("task registry mutex poisoned");
        let finished = match registry.servers.get_mut(&self.server) {
            Some(scope) if scope.generation == self.generation => {
                scope.active -= 1;
                scope.active == 0
            }
            _ => false,
        };
        if finished {
            registry.servers.remove(&self.server);
        }
    }
}

/// Releases an admission slot on drop.
struct AdmissionGuard<'a> {
    resources: &'a ResourceMonitor,
    check_id: Uuid,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.resources.release(self.check_id);
    }
}

/// Withdraws a queue ticket on drop; a no-op once the ticket was admitted.
struct QueueGuard<'a> {
    resources: &'a ResourceMonitor,
    ticket: Uuid,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.resources.remove_pending(self.ticket);
    }
}

enum Collected {
    Done(Option<ProtocolResult>, Option<ProtocolResult>),
    TimedOut,
    Cancelled,
}

/// Top-level coordinator of dual checks.
pub struct DualCheckOrchestrator {
    config: OrchestratorConfig,
    deps: Collaborators,
    dispatch: Semaphore,
    fleet: Semaphore,
    registry: Mutex<TaskRegistry>,
    next_generation: AtomicU64,
}

impl DualCheckOrchestrator {
    pub fn new(config: OrchestratorConfig, deps: Collaborators) -> HealthResult<Self> {
        config.validate()?;
        Ok(Self {
            dispatch: Semaphore::new(config.dispatch_concurrency),
            fleet: Semaphore::new(config.fleet_concurrency),
            config,
            deps,
            registry: Mutex::new(TaskRegistry {
                root: CancellationToken::new(),
                servers: HashMap::new(),
            }),
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.deps
    }

    /// Check one server under the given breaker state.
    ///
    /// Returns `Err(HealthError::ResourceExhausted)` when admission control
    /// rejects the check; every other outcome is a [`DualCheckResult`].
    pub async fn check_server(
        &self,
        target: &ServerTarget,
        breaker: CircuitBreakerState,
    ) -> HealthResult<DualCheckResult> {
        self.run_check(target, breaker, None).await
    }

    async fn run_check(
        &self,
        target: &ServerTarget,
        breaker: CircuitBreakerState,
        admitted: Option<AdmissionGuard<'_>>,
    ) -> HealthResult<DualCheckResult> {
        let active = self.deps.metrics.start_check();
        let outcome = self.dispatch_check(target, breaker, admitted).await;
        if let Ok(result) = &outcome {
            active.finish(result);
        }
        outcome
    }

    /// `admitted` carries a slot already granted through the admission queue.
    async fn dispatch_check(
        &self,
        target: &ServerTarget,
        breaker: CircuitBreakerState,
        admitted: Option<AdmissionGuard<'_>>,
    ) -> HealthResult<DualCheckResult> {
        let name = target.name();

        if breaker == CircuitBreakerState::Open {
            tracing::debug!(server = %name, "Circuit breaker open, skipping check");
            return Ok(DualCheckResult::synthetic(
                name,
                HealthStatus::Unhealthy,
                BREAKER_OPEN,
                0.0,
            ));
        }

        let run_capability =
            target.is_enabled(Protocol::Capability) && breaker != CircuitBreakerState::RestOnly;
        let run_rest = target.is_enabled(Protocol::Rest) && breaker != CircuitBreakerState::CapOnly;

        if !run_capability && !run_rest {
            let mut result = combine(None, None, &self.config.aggregation);
            result.server_name = name.to_string();
            result.timestamp = Utc::now();
            return Ok(result);
        }

        let _admission = match admitted {
            Some(guard) => guard,
            None => {
                let check_id = Uuid::new_v4();
                if !self.deps.resources.try_admit(check_id) {
                    return Err(HealthError::ResourceExhausted {
                        check_id,
                        active: self.deps.resources.active_count(),
                        limit: self.deps.resources.limits().max_concurrent_checks,
                    });
                }
                AdmissionGuard {
                    resources: &self.deps.resources,
                    check_id,
                }
            }
        };

        let scope = self.enter_scope(name);
        let _permit = tokio::select! {
            permit = self.dispatch.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(cancelled(name)),
            },
            _ = scope.token.cancelled() => return Ok(cancelled(name)),
        };

        let mut timeouts = Vec::with_capacity(2);
        let mut capability_task = None;
        let mut rest_task = None;
        if run_capability {
            timeouts.push(target.timeout(Protocol::Capability));
            let client = self.deps.capability_client.clone();
            capability_task = Some(self.spawn_probe(client, target, &scope.token));
        }
        if run_rest {
            timeouts.push(target.timeout(Protocol::Rest));
            let client = self.deps.rest_client.clone();
            rest_task = Some(self.spawn_probe(client, target, &scope.token));
        }
        let deadline = overall_deadline(timeouts, self.config.timeout_buffer);

        let collected = tokio::select! {
            biased;
            _ = scope.token.cancelled() => Collected::Cancelled,
            joined = with_timeout(
                deadline,
                join_probes(name, &mut capability_task, &mut rest_task),
            ) => {
                match joined {
                    Ok((capability, rest)) => Collected::Done(capability, rest),
                    Err(_) => Collected::TimedOut,
                }
            }
        };

        // Stragglers are cancelled whatever the outcome.
        scope.token.cancel();
        for task in [capability_task, rest_task].into_iter().flatten() {
            task.abort();
        }

        let result = match collected {
            Collected::Done(capability, rest) => {
                for probe in [&capability, &rest].into_iter().flatten() {
                    metrics::record_protocol_result(probe);
                }
                let config = self.config.aggregation.with_weights(target.weights());
                combine(capability.as_ref(), rest.as_ref(), &config)
            }
            Collected::TimedOut => {
                tracing::warn!(
                    server = %name,
                    deadline_ms = deadline.as_millis() as u64,
                    "Health check timed out"
                );
                DualCheckResult::synthetic(
                    name,
                    HealthStatus::Unhealthy,
                    CHECK_TIMEOUT,
                    deadline.as_secs_f64() * 1000.0,
                )
            }
            Collected::Cancelled => cancelled(name),
        };

        tracing::debug!(
            server = %name,
            status = ?result.overall_status,
            score = result.health_score,
            response_ms = result.combined_response_time_ms,
            "Dual check complete"
        );
        Ok(result)
    }

    fn spawn_probe(
        &self,
        client: Arc<dyn ProbeClient>,
        target: &ServerTarget,
        scope: &CancellationToken,
    ) -> JoinHandle<Option<ProtocolResult>> {
        let target = target.clone();
        let pools = self.deps.pools.clone();
        let auth = self.deps.auth.clone();
        let cancel = scope.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                result = run_probe(client, pools, auth, target) => Some(result),
            }
        })
    }

    /// Retry `check_server` while the result is not successful.
    ///
    /// Always returns a result: admission rejection and cancellation become
    /// synthetic UNKNOWN results.
    pub async fn check_server_with_retry(
        &self,
        target: &ServerTarget,
        policy: &RetryPolicy,
    ) -> DualCheckResult {
        let attempts = policy.attempts();
        let root = self.root_token();
        let mut last = None;

        for attempt in 0..attempts {
            let breaker = self.deps.breakers.state(target.name());
            let result = match self.check_server(target, breaker).await {
                Ok(result) => result,
                Err(e) => unknown(target.name(), e.to_string()),
            };
            if result.overall_success || breaker == CircuitBreakerState::Open {
                return result;
            }
            last = Some(result);

            if attempt + 1 < attempts {
                let delay = policy.delay_after(attempt);
                metrics::record_backoff(target.name(), attempt + 1, delay.as_millis() as u64);
                tokio::select! {
                    _ = time::sleep(delay) => {}
                    _ = root.cancelled() => break,
                }
            }
        }

        last.unwrap_or_else(|| cancelled(target.name()))
    }

    /// Check every target, at most `fleet_concurrency` at a time.
    /// Results are in input order; one server's failure never fails the batch.
    pub async fn check_fleet(
        &self,
        targets: &[ServerTarget],
        timeout_override: Option<Duration>,
    ) -> Vec<DualCheckResult> {
        let started = Instant::now();
        let checks = targets.iter().map(|target| async move {
            let target = match timeout_override {
                Some(timeout) => target.with_timeout(timeout),
                None => target.clone(),
            };
            let _permit = match self.fleet.acquire().await {
                Ok(permit) => permit,
                Err(_) => return cancelled(target.name()),
            };
            self.check_fleet_member(&target).await
        });

        let results = join_all(checks).await;
        tracing::info!(
            servers = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fleet check complete"
        );
        results
    }

    async fn check_fleet_member(&self, target: &ServerTarget) -> DualCheckResult {
        let breaker = self.deps.breakers.state(target.name());
        match self.check_server(target, breaker).await {
            Ok(result) => result,
            Err(HealthError::ResourceExhausted { .. }) => {
                self.check_after_queue(target, breaker).await
            }
            Err(e) => unknown(target.name(), e.to_string()),
        }
    }

    /// Wait in the admission queue, then run on the slot granted at the head.
    async fn check_after_queue(
        &self,
        target: &ServerTarget,
        breaker: CircuitBreakerState,
    ) -> DualCheckResult {
        let resources = &self.deps.resources;
        let ticket = Uuid::new_v4();

        if !resources.enqueue(ticket, target.priority()) {
            return unknown(target.name(), RESOURCE_EXHAUSTED);
        }
        let _queued = QueueGuard { resources, ticket };
        tracing::debug!(
            server = %target.name(),
            priority = target.priority(),
            "Check queued for admission"
        );

        let root = self.root_token();
        let admitted = tokio::select! {
            turn = resources.wait_for_turn(ticket, self.config.queue_wait_timeout) => turn,
            _ = root.cancelled() => return cancelled(target.name()),
        };
        if !admitted {
            return unknown(target.name(), RESOURCE_EXHAUSTED);
        }
        let slot = AdmissionGuard {
            resources,
            check_id: ticket,
        };

        match self.run_check(target, breaker, Some(slot)).await {
            Ok(result) => result,
            Err(e) => unknown(target.name(), e.to_string()),
        }
    }

    /// Cancel every in-flight check. Idempotent.
    pub fn cancel_all(&self) -> usize {
        let mut registry = self.registry.lock().expect("task registry mutex poisoned");
        let cancelled = registry.servers.len();
        registry.root.cancel();
        registry.root = CancellationToken::new();
        registry.servers.clear();
        if cancelled > 0 {
            tracing::info!(servers = cancelled, "Cancelled all in-flight checks");
        }
        cancelled
    }

    /// Cancel in-flight checks of one server. Returns false if none were running.
    pub fn cancel_server(&self, server_name: &str) -> bool {
        let scope = self
            .registry
            .lock()
            .expect("task registry mutex poisoned")
            .servers
            .remove(server_name);
        match scope {
            Some(scope) => {
                scope.token.cancel();
                tracing::info!(server = %server_name, "Cancelled in-flight checks");
                true
            }
            None => false,
        }
    }

    /// Servers with checks currently registered.
    pub fn in_flight_servers(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("task registry mutex poisoned");
        let mut names: Vec<String> = registry.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.deps.metrics.snapshot(
            self.deps.cache.hit_rate(),
            self.deps.pools.utilization(Protocol::Capability),
            self.deps.pools.utilization(Protocol::Rest),
            self.deps.resources.queue_len(),
        )
    }

    fn root_token(&self) -> CancellationToken {
        self.registry.lock().expect("task registry mutex poisoned").root.clone()
    }

    fn enter_scope(&self, server: &str) -> ScopeGuard<'_> {
        let mut registry = self.registry.lock().expect("task registry mutex poisoned");
        let root = registry.root.clone();
        let scope = registry.servers.entry(server.to_string()).or_insert_with(|| ServerScope {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            token: root.child_token(),
            active: 0,
        });
        scope.active += 1;

        ScopeGuard {
            registry: &self.registry,
            server: server.to_string(),
            generation: scope.generation,
            token: scope.token.child_token(),
        }
    }
}

async fn run_probe(
    client: Arc<dyn ProbeClient>,
    pools: Arc<ConnectionPoolManager>,
    auth: Arc<dyn AuthProvider>,
    target: ServerTarget,
) -> ProtocolResult {
    let protocol = client.protocol();
    let token = match auth.get_token(&target).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(
                server = %target.name(),
                error = %e,
                "Token acquisition failed, probing without auth"
            );
            None
        }
    };

    let pool = pools.get_pool(protocol);
    let (client, pool, target, token) = (&client, &pool, &target, &token);
    retry_probe(target.retries(protocol), move || async move {
        let started = Instant::now();
        match pool.acquire().await {
            Ok(lease) => client.invoke(target, &lease, token.as_deref()).await,
            Err(e) => ProtocolResult::failure(
                target.name(),
                protocol,
                started.elapsed().as_secs_f64() * 1000.0,
                ProbeError::from(&e),
            ),
        }
    })
    .await
}

async fn join_probes(
    server: &str,
    capability: &mut Option<JoinHandle<Option<ProtocolResult>>>,
    rest: &mut Option<JoinHandle<Option<ProtocolResult>>>,
) -> (Option<ProtocolResult>, Option<ProtocolResult>) {
    let capability = match capability.as_mut() {
        Some(task) => Some(settle(server, Protocol::Capability, task.await)),
        None => None,
    };
    let rest = match rest.as_mut() {
        Some(task) => Some(settle(server, Protocol::Rest, task.await)),
        None => None,
    };
    (capability, rest)
}

/// A subtask that panicked or was cancelled still yields a failed result.
fn settle(
    server: &str,
    protocol: Protocol,
    joined: Result<Option<ProtocolResult>, JoinError>,
) -> ProtocolResult {
    match joined {
        Ok(Some(result)) => result,
        Ok(None) => ProtocolResult::failure(
            server,
            protocol,
            0.0,
            ProbeError::new(ErrorKind::Connection, "probe cancelled"),
        ),
        Err(e) => {
            tracing::error!(
                server = %server,
                protocol = %protocol,
                error = %e,
                "Probe task failed"
            );
            ProtocolResult::failure(
                server,
                protocol,
                0.0,
                ProbeError::new(ErrorKind::Protocol, format!("probe task failed: {e}")),
            )
        }
    }
}

fn cancelled(server: &str) -> DualCheckResult {
    unknown(server, CHECK_CANCELLED)
}

fn unknown(server: &str, error: impl Into<String>) -> DualCheckResult {
    DualCheckResult::synthetic(server, HealthStatus::Unknown, error, 0.0)
}
