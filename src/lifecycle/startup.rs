//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Build every subsystem in dependency order
//! - Start background loops (sweepers, sampler, batching, fleet monitor)
//! - Bind the admin API last
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Probe clients and the resource sampler are injectable so the whole
//!   engine can run against scripted backends

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::admin::{setup_admin_router, AdminState};
use crate::config::schema::HealthConfig;
use crate::config::validation::validate_config;
use crate::health::monitor::{run_batch_consumer, FleetMonitor};
use crate::health::orchestrator::{Collaborators, DualCheckOrchestrator};
use crate::health::types::{HealthError, HealthResult};
use crate::lifecycle::shutdown::Shutdown;
use crate::observability::metrics::EngineMetrics;
use crate::protocol::{
    AuthProvider, CachedAuthProvider, CapabilityProbeClient, EnvTokenProvider, ProbeClient,
    RestProbeClient,
};
use crate::resilience::circuit_breaker::BreakerBook;
use crate::resilience::retries::RetryPolicy;
use crate::resources::admission::{ResourceMonitor, ResourceSampler, SystemSampler};
use crate::resources::cache::CacheManager;
use crate::resources::pool::ConnectionPoolManager;
use crate::scheduler::batch::{Batch, BatchScheduler};

/// Depth of the scheduler → consumer batch channel.
const BATCH_CHANNEL_DEPTH: usize = 64;

/// A fully wired engine instance.
pub struct Engine {
    config: HealthConfig,
    monitor: Arc<FleetMonitor>,
    scheduler: Arc<BatchScheduler>,
    retry_policy: RetryPolicy,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    admin_addr: Mutex<Option<SocketAddr>>,
}

impl Engine {
    /// Build an engine with the network probe clients and the system sampler.
    pub fn from_config(config: HealthConfig) -> HealthResult<Self> {
        Self::with_parts(
            config,
            Arc::new(CapabilityProbeClient::new()),
            Arc::new(RestProbeClient::new()),
            Arc::new(SystemSampler::new()),
        )
    }

    pub fn with_parts(
        config: HealthConfig,
        capability_client: Arc<dyn ProbeClient>,
        rest_client: Arc<dyn ProbeClient>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> HealthResult<Self> {
        if let Err(errors) = validate_config(&config) {
            let joined = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
            return Err(HealthError::Configuration(joined));
        }

        let pools = Arc::new(ConnectionPoolManager::new(
            config.pools.capability.to_pool_config(),
            config.pools.rest.to_pool_config(),
            Duration::from_secs(config.pools.sweep_interval_secs),
        )?);
        let cache = Arc::new(CacheManager::new(config.cache_config())?);
        let resources = Arc::new(ResourceMonitor::new(config.resource_limits()?, sampler)?);
        let breakers = Arc::new(BreakerBook::new(config.breaker_config()?));
        let auth: Arc<dyn AuthProvider> =
            Arc::new(CachedAuthProvider::new(Arc::new(EnvTokenProvider), cache.clone()));

        let orchestrator = Arc::new(DualCheckOrchestrator::new(
            config.orchestrator_config()?,
            Collaborators {
                capability_client,
                rest_client,
                auth,
                breakers: breakers.clone(),
                pools,
                resources,
                cache,
                metrics: Arc::new(EngineMetrics::new()),
            },
        )?);

        let monitor = Arc::new(FleetMonitor::new(
            orchestrator,
            breakers,
            config.server_targets()?,
            Duration::from_secs(config.engine.check_interval_secs),
        ));
        let scheduler = Arc::new(BatchScheduler::new(config.batch_config()?));
        let retry_policy = config.retry_policy()?;

        tracing::info!(
            servers = config.servers.len(),
            dispatch_concurrency = config.engine.dispatch_concurrency,
            fleet_concurrency = config.engine.fleet_concurrency,
            "Engine initialized"
        );

        Ok(Self {
            config,
            monitor,
            scheduler,
            retry_policy,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            admin_addr: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<DualCheckOrchestrator> {
        self.monitor.orchestrator()
    }

    pub fn monitor(&self) -> &Arc<FleetMonitor> {
        &self.monitor
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    /// Address the admin API is bound to, once started.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        *self.admin_addr.lock().expect("admin addr mutex poisoned")
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState::new(
            self.monitor.clone(),
            self.scheduler.clone(),
            self.retry_policy,
            &self.config.admin.api_key,
        )
    }

    /// Spawn the background loops and bind the admin API.
    ///
    /// `updates` carries reloaded configurations from the file watcher.
    pub async fn start(
        &self,
        updates: Option<mpsc::UnboundedReceiver<HealthConfig>>,
    ) -> HealthResult<()> {
        let deps = self.orchestrator().collaborators().clone();
        let mut handles = Vec::new();

        handles.push(tokio::spawn(deps.cache.clone().run_sweeper(self.shutdown.subscribe())));
        handles.push(tokio::spawn(deps.pools.clone().run_sweeper(self.shutdown.subscribe())));
        handles.push(tokio::spawn(deps.resources.clone().run_sampler(self.shutdown.subscribe())));

        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(BATCH_CHANNEL_DEPTH);
        let scheduler = self.scheduler.clone();
        let batch_shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move { scheduler.run(batch_tx, batch_shutdown).await }));
        handles.push(tokio::spawn(run_batch_consumer(self.monitor.clone(), batch_rx)));

        // A closed channel just disables reloads.
        let updates = updates.unwrap_or_else(|| mpsc::unbounded_channel().1);
        handles.push(tokio::spawn(self.monitor.clone().run(self.shutdown.subscribe(), updates)));

        if self.config.admin.enabled {
            handles.push(self.start_admin().await?);
        }

        self.tasks.lock().expect("engine task mutex poisoned").extend(handles);
        tracing::info!("Engine started");
        Ok(())
    }

    async fn start_admin(&self) -> HealthResult<JoinHandle<()>> {
        let addr: SocketAddr = self.config.admin.bind_address.parse().map_err(|e| {
            HealthError::Configuration(format!("admin.bind_address: {e}"))
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| {
                HealthError::Connection(format!("failed to bind admin API on {addr}: {e}"))
            })?;
        let local = listener
            .local_addr()
            .map_err(|e| HealthError::Connection(e.to_string()))?;
        *self.admin_addr.lock().expect("admin addr mutex poisoned") = Some(local);

        let router = setup_admin_router(self.admin_state());
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(address = %local, "Admin API listening");

        Ok(tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "Admin API server error");
            }
        }))
    }

    /// Stop every loop, cancel in-flight checks and close the pools.
    ///
    /// Tasks still running after `grace` are aborted.
    pub async fn stop(&self, grace: Duration) {
        tracing::info!("Engine shutting down");
        let deadline = Instant::now() + grace;

        self.shutdown.trigger();
        let cancelled = self.orchestrator().cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled in-flight checks");
        }

        let lingering = self.shutdown.drained(grace).await;
        if lingering > 0 {
            tracing::warn!(lingering, "Background loops still running after grace period");
        }

        let handles = std::mem::take(&mut *self.tasks.lock().expect("engine task mutex poisoned"));
        for mut handle in handles {
            if time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        self.orchestrator().collaborators().pools.close();
        tracing::info!("Engine stopped");
    }
}
