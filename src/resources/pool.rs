//! Outbound connection pool management.
//!
//! # Responsibilities
//! - Own one independent pool per protocol (capability, REST)
//! - Create each pool lazily on first use
//! - Bound in-flight requests per pool (max total connections)
//! - Periodically drop idle pools so stale keep-alive connections close
//!
//! # Design Decisions
//! - Each pool has its own lock and semaphore; saturating one never blocks the other
//! - A lease holds a permit for the lifetime of one probe (RAII, like a connection guard)
//! - A swept pool is rebuilt transparently on the next acquire

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};

use crate::health::types::{HealthError, HealthResult, Protocol};
use crate::observability::metrics;

/// Limits of one protocol's pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum concurrent connections across all hosts.
    pub max_connections: usize,
    /// Maximum idle connections kept per host.
    pub max_connections_per_host: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Idle time after which connections are closed.
    pub keepalive: Duration,
}

impl PoolConfig {
    pub fn validate(&self) -> HealthResult<()> {
        if self.max_connections == 0 {
            return Err(HealthError::Configuration("pool max_connections must be > 0".into()));
        }
        let per_host = self.max_connections_per_host;
        if per_host == 0 || per_host > self.max_connections {
            return Err(HealthError::Configuration(format!(
                "pool max_connections_per_host must be within 1..={}",
                self.max_connections
            )));
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(HealthError::Configuration("pool timeouts must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_host: 10,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Snapshot of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub protocol: Protocol,
    pub connected: bool,
    pub in_use: usize,
    pub max_connections: usize,
    pub utilization: f64,
}

/// An HTTP connection pool for one protocol.
#[derive(Debug)]
pub struct ConnectionPool {
    protocol: Protocol,
    config: PoolConfig,
    client: Mutex<Option<reqwest::Client>>,
    last_used: Mutex<Instant>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ConnectionPool {
    fn new(protocol: Protocol, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections));
        Self {
            protocol,
            config,
            client: Mutex::new(None),
            last_used: Mutex::new(Instant::now()),
            permits,
            closed: AtomicBool::new(false),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a lease, waiting at most `connect_timeout` for a free slot.
    pub async fn acquire(&self) -> HealthResult<PoolLease> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HealthError::Connection(format!("{} pool is closed", self.protocol)));
        }

        let permit = match time::timeout(
            self.config.connect_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(HealthError::Connection(format!("{} pool is closed", self.protocol)))
            }
            Err(_) => {
                tracing::warn!(
                    protocol = %self.protocol,
                    max_connections = self.config.max_connections,
                    "Pool saturated, no free connection slot"
                );
                return Err(HealthError::Timeout(self.config.connect_timeout.as_millis() as u64));
            }
        };

        let client = self.client()?;
        *self.last_used.lock().expect("pool mutex poisoned") = Instant::now();
        metrics::record_pool_utilization(self.protocol, self.utilization());

        Ok(PoolLease {
            client,
            protocol: self.protocol,
            _permit: permit,
        })
    }

    fn client(&self) -> HealthResult<reqwest::Client> {
        let mut slot = self.client.lock().expect("pool mutex poisoned");
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(self.config.max_connections_per_host)
            .pool_idle_timeout(self.config.keepalive)
            .tcp_keepalive(self.config.keepalive)
            .connect_timeout(self.config.connect_timeout)
            .read_timeout(self.config.read_timeout)
            .user_agent(concat!("dual-health/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                HealthError::Configuration(format!("failed to build {} client: {e}", self.protocol))
            })?;

        tracing::debug!(protocol = %self.protocol, "Connection pool created");
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Number of leases currently held.
    pub fn in_use(&self) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.config
            .max_connections
            .saturating_sub(self.permits.available_permits())
    }

    pub fn utilization(&self) -> f64 {
        self.in_use() as f64 / self.config.max_connections as f64
    }

    /// Whether an underlying client currently exists.
    pub fn is_connected(&self) -> bool {
        self.client.lock().expect("pool mutex poisoned").is_some()
    }

    /// Drop the client if nothing is in flight and it idled past keep-alive.
    pub fn sweep_idle(&self) -> bool {
        if self.in_use() > 0 {
            return false;
        }
        let idle_for = self.last_used.lock().expect("pool mutex poisoned").elapsed();
        if idle_for < self.config.keepalive {
            return false;
        }
        let dropped = self.client.lock().expect("pool mutex poisoned").take().is_some();
        if dropped {
            tracing::debug!(
                protocol = %self.protocol,
                idle_ms = idle_for.as_millis() as u64,
                "Idle pool swept"
            );
        }
        dropped
    }

    /// Close the pool: pending and future acquires fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.client.lock().expect("pool mutex poisoned").take();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            protocol: self.protocol,
            connected: self.is_connected(),
            in_use: self.in_use(),
            max_connections: self.config.max_connections,
            utilization: self.utilization(),
        }
    }
}

/// A held connection slot. Releases the slot on drop.
#[derive(Debug)]
pub struct PoolLease {
    client: reqwest::Client,
    protocol: Protocol,
    _permit: OwnedSemaphorePermit,
}

impl PoolLease {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl Deref for PoolLease {
    type Target = reqwest::Client;
    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Owns the capability and REST pools.
#[derive(Debug)]
pub struct ConnectionPoolManager {
    capability_config: PoolConfig,
    rest_config: PoolConfig,
    capability: OnceLock<Arc<ConnectionPool>>,
    rest: OnceLock<Arc<ConnectionPool>>,
    sweep_interval: Duration,
    closed: AtomicBool,
}

impl ConnectionPoolManager {
    pub fn new(
        capability_config: PoolConfig,
        rest_config: PoolConfig,
        sweep_interval: Duration,
    ) -> HealthResult<Self> {
        capability_config.validate()?;
        rest_config.validate()?;
        if sweep_interval.is_zero() {
            return Err(HealthError::Configuration("pool sweep interval must be > 0".into()));
        }
        Ok(Self {
            capability_config,
            rest_config,
            capability: OnceLock::new(),
            rest: OnceLock::new(),
            sweep_interval,
            closed: AtomicBool::new(false),
        })
    }

    /// Get (creating on first use) the pool for a protocol.
    pub fn get_pool(&self, protocol: Protocol) -> Arc<ConnectionPool> {
        let (slot, config) = match protocol {
            Protocol::Capability => (&self.capability, &self.capability_config),
            Protocol::Rest => (&self.rest, &self.rest_config),
        };
        let pool = slot
            .get_or_init(|| Arc::new(ConnectionPool::new(protocol, config.clone())))
            .clone();
        if self.closed.load(Ordering::Acquire) {
            pool.close();
        }
        pool
    }

    /// True once the protocol's pool has been created.
    pub fn is_initialized(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Capability => self.capability.get().is_some(),
            Protocol::Rest => self.rest.get().is_some(),
        }
    }

    /// Utilization of a protocol's pool (0 if never created).
    pub fn utilization(&self, protocol: Protocol) -> f64 {
        self.pool_if_created(protocol)
            .map(|p| p.utilization())
            .unwrap_or(0.0)
    }

    fn pool_if_created(&self, protocol: Protocol) -> Option<&Arc<ConnectionPool>> {
        match protocol {
            Protocol::Capability => self.capability.get(),
            Protocol::Rest => self.rest.get(),
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        [Protocol::Capability, Protocol::Rest]
            .into_iter()
            .filter_map(|p| self.pool_if_created(p).map(|pool| pool.stats()))
            .collect()
    }

    /// Sweep idle pools once. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        [Protocol::Capability, Protocol::Rest]
            .into_iter()
            .filter_map(|p| self.pool_if_created(p))
            .filter(|pool| pool.sweep_idle())
            .count()
    }

    /// Tear down both pools.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for pool in [self.capability.get(), self.rest.get()].into_iter().flatten() {
            pool.close();
        }
        tracing::info!("Connection pools closed");
    }

    /// Periodic idle sweep until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.sweep_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = self.sweep();
                    if swept > 0 {
                        tracing::debug!(swept, "Pool sweep closed idle connections");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Pool sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
