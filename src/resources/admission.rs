//! Resource-aware admission control.
//!
//! # Responsibilities
//! - Track in-flight checks against a global ceiling
//! - Sample process-wide memory and CPU pressure
//! - Hold rejected checks in a bounded priority queue
//!
//! # Design Decisions
//! - Independent of the orchestrator's semaphores: this layer reacts to
//!   system pressure, not call-site concurrency
//! - Active set and pending queue are guarded by separate locks
//! - The latest resource sample is swapped atomically; admission never
//!   blocks on a sampler
//! - Queue order is highest priority first, FIFO among equals

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use sysinfo::System;
use tokio::sync::{broadcast, Notify};
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::health::types::{HealthError, HealthResult};
use crate::observability::metrics;

/// Ceilings enforced by the [`ResourceMonitor`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub max_concurrent_checks: usize,
    pub max_queue_size: usize,
    /// Memory usage ceiling, percent of total (0-100].
    pub max_memory_percent: f64,
    /// CPU usage ceiling, percent (0-100].
    pub max_cpu_percent: f64,
    #[serde(skip)]
    pub sample_interval: Duration,
}

impl ResourceLimits {
    pub fn new(
        max_concurrent_checks: usize,
        max_queue_size: usize,
        max_memory_percent: f64,
        max_cpu_percent: f64,
        sample_interval: Duration,
    ) -> HealthResult<Self> {
        let limits = Self {
            max_concurrent_checks,
            max_queue_size,
            max_memory_percent,
            max_cpu_percent,
            sample_interval,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> HealthResult<()> {
        if self.max_concurrent_checks == 0 {
            return Err(HealthError::Configuration("max_concurrent_checks must be > 0".into()));
        }
        for (name, value) in [
            ("max_memory_percent", self.max_memory_percent),
            ("max_cpu_percent", self.max_cpu_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(HealthError::Configuration(format!(
                    "{name} must be within (0, 100] (got {value})"
                )));
            }
        }
        if self.sample_interval.is_zero() {
            return Err(HealthError::Configuration("resource sample interval must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_checks: 100,
            max_queue_size: 1000,
            max_memory_percent: 85.0,
            max_cpu_percent: 90.0,
            sample_interval: Duration::from_secs(5),
        }
    }
}

/// One sample of system pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

/// Source of resource samples.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Samples the host with `sysinfo`.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> ResourceUsage {
        let mut system = self.system.lock().expect("sampler mutex poisoned");
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        ResourceUsage {
            memory_percent,
            cpu_percent: system.global_cpu_usage() as f64,
        }
    }
}

/// A check waiting for admission.
#[derive(Debug, Clone)]
pub struct PendingCheck {
    pub check_id: Uuid,
    pub priority: u32,
    pub enqueued_at: Instant,
    seq: u64,
}

impl PartialEq for PendingCheck {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingCheck {}

impl PartialOrd for PendingCheck {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingCheck {
    // Max-heap: higher priority first, then lower sequence (older) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Snapshot of admission state.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub active_checks: usize,
    pub queue_length: usize,
    pub usage: ResourceUsage,
    pub limits: ResourceLimits,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

/// Admission controller gating new checks on system pressure.
pub struct ResourceMonitor {
    limits: ResourceLimits,
    sampler: Arc<dyn ResourceSampler>,
    usage: ArcSwap<ResourceUsage>,
    active: Mutex<HashSet<Uuid>>,
    queue: Mutex<BinaryHeap<PendingCheck>>,
    next_seq: AtomicU64,
    released: Notify,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl ResourceMonitor {
    /// Create a monitor and take an initial sample.
    pub fn new(limits: ResourceLimits, sampler: Arc<dyn ResourceSampler>) -> HealthResult<Self> {
        limits.validate()?;
        let usage = sampler.sample();
        Ok(Self {
            limits,
            sampler,
            usage: ArcSwap::from_pointee(usage),
            active: Mutex::new(HashSet::new()),
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            released: Notify::new(),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Take a fresh sample now.
    pub fn refresh(&self) -> ResourceUsage {
        let usage = self.sampler.sample();
        self.usage.store(Arc::new(usage));
        usage
    }

    /// Latest sampled usage.
    pub fn usage(&self) -> ResourceUsage {
        **self.usage.load()
    }

    fn under_pressure(&self) -> bool {
        let usage = self.usage();
        usage.memory_percent >= self.limits.max_memory_percent
            || usage.cpu_percent >= self.limits.max_cpu_percent
    }

    /// Admit a check if below the in-flight ceiling and resource ceilings.
    pub fn try_admit(&self, check_id: Uuid) -> bool {
        let pressure = self.under_pressure();
        let mut active = self.active.lock().expect("resource monitor mutex poisoned");

        let admitted = !pressure && active.len() < self.limits.max_concurrent_checks;
        if admitted {
            active.insert(check_id);
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                check_id = %check_id,
                active = active.len(),
                limit = self.limits.max_concurrent_checks,
                pressure,
                "Admission rejected"
            );
        }
        metrics::record_admission(admitted);
        admitted
    }

    /// Remove a check from the active set.
    pub fn release(&self, check_id: Uuid) {
        let removed = self
            .active
            .lock()
            .expect("resource monitor mutex poisoned")
            .remove(&check_id);
        if removed {
            self.released.notify_waiters();
        }
    }

    /// Number of admitted, unreleased checks.
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("resource monitor mutex poisoned").len()
    }

    /// Queue a rejected check. Fails when the queue is full.
    pub fn enqueue(&self, check_id: Uuid, priority: u32) -> bool {
        let mut queue = self.queue.lock().expect("resource monitor mutex poisoned");
        if queue.len() >= self.limits.max_queue_size {
            tracing::warn!(
                check_id = %check_id,
                max_queue_size = self.limits.max_queue_size,
                "Pending queue full"
            );
            return false;
        }
        queue.push(PendingCheck {
            check_id,
            priority,
            enqueued_at: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        });
        metrics::record_queue_length(queue.len());
        true
    }

    /// Pop the highest-priority, oldest pending check.
    pub fn dequeue(&self) -> Option<Uuid> {
        let mut queue = self.queue.lock().expect("resource monitor mutex poisoned");
        let next = queue.pop().map(|p| p.check_id);
        metrics::record_queue_length(queue.len());
        next
    }

    /// Drop a pending check (e.g. after its wait expired).
    pub fn remove_pending(&self, check_id: Uuid) -> bool {
        let mut queue = self.queue.lock().expect("resource monitor mutex poisoned");
        let before = queue.len();
        queue.retain(|p| p.check_id != check_id);
        before != queue.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("resource monitor mutex poisoned").len()
    }

    /// Admit `check_id` if it heads the queue and capacity is free.
    /// Dequeue and admission happen under the queue lock, so a fresh
    /// `try_admit` cannot take the slot in between.
    fn admit_head(&self, check_id: Uuid) -> bool {
        if self.under_pressure() {
            return false;
        }
        let mut queue = self.queue.lock().expect("resource monitor mutex poisoned");
        if queue.peek().map(|p| p.check_id) != Some(check_id) {
            return false;
        }
        let mut active = self.active.lock().expect("resource monitor mutex poisoned");
        if active.len() >= self.limits.max_concurrent_checks {
            return false;
        }
        queue.pop();
        active.insert(check_id);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        metrics::record_queue_length(queue.len());
        metrics::record_admission(true);
        true
    }

    /// Wait until `check_id` reaches the head of the queue while capacity is
    /// free, then admit it under the same id; the caller must `release` it.
    /// Returns false (and drops the entry) if `timeout` passes first.
    pub async fn wait_for_turn(&self, check_id: Uuid, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let released = self.released.notified();
            if self.admit_head(check_id) {
                return true;
            }
            if Instant::now() >= deadline {
                self.remove_pending(check_id);
                return false;
            }
            // Pressure can ease without a release, so poll on the sample interval too.
            let nap = self.limits.sample_interval.min(deadline - Instant::now());
            tokio::select! {
                _ = released => {}
                _ = time::sleep(nap) => {}
            }
        }
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            active_checks: self.active_count(),
            queue_length: self.queue_len(),
            usage: self.usage(),
            limits: self.limits.clone(),
            total_admitted: self.admitted.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Periodic resampling until shutdown.
    pub async fn run_sampler(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.limits.sample_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let usage = self.refresh();
                    if usage.memory_percent >= self.limits.max_memory_percent
                        || usage.cpu_percent >= self.limits.max_cpu_percent
                    {
                        tracing::warn!(
                            memory_percent = usage.memory_percent,
                            cpu_percent = usage.cpu_percent,
                            "System under pressure, admission paused"
                        );
                    } else {
                        // Pressure may have eased; wake queued checks.
                        self.released.notify_waiters();
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Resource sampler received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Sampler returning a settable value. Useful for tests and for hosts where
/// system sampling is undesirable.
#[derive(Debug, Default)]
pub struct FixedSampler {
    usage: Mutex<ResourceUsage>,
}

impl FixedSampler {
    pub fn new(memory_percent: f64, cpu_percent: f64) -> Self {
        Self {
            usage: Mutex::new(ResourceUsage {
                memory_percent,
                cpu_percent,
            }),
        }
    }

    pub fn set(&self, memory_percent: f64, cpu_percent: f64) {
        *self.usage.lock().expect("sampler mutex poisoned") = ResourceUsage {
            memory_percent,
            cpu_percent,
        };
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> ResourceUsage {
        *self.usage.lock().expect("sampler mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(max_checks: usize, max_queue: usize, sampler: Arc<FixedSampler>) -> ResourceMonitor {
        ResourceMonitor::new(
            ResourceLimits {
                max_concurrent_checks: max_checks,
                max_queue_size: max_queue,
                max_memory_percent: 80.0,
                max_cpu_percent: 80.0,
                sample_interval: Duration::from_millis(50),
            },
            sampler,
        )
        .unwrap()
    }

    #[test]
    fn test_admission_ceiling() {
        let rm = monitor(3, 10, Arc::new(FixedSampler::new(10.0, 10.0)));
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        for id in &ids[..3] {
            assert!(rm.try_admit(*id));
        }
        assert!(!rm.try_admit(ids[3]));

        rm.release(ids[0]);
        assert!(rm.try_admit(ids[3]));
        assert_eq!(rm.active_count(), 3);

        let stats = rm.stats();
        assert_eq!(stats.total_admitted, 4);
        assert_eq!(stats.total_rejected, 1);
    }

    #[test]
    fn test_pressure_blocks_admission() {
        let sampler = Arc::new(FixedSampler::new(95.0, 10.0));
        let rm = monitor(10, 10, sampler.clone());
        assert!(!rm.try_admit(Uuid::new_v4()));

        sampler.set(10.0, 99.0);
        rm.refresh();
        assert!(!rm.try_admit(Uuid::new_v4()));

        sampler.set(10.0, 10.0);
        rm.refresh();
        assert!(rm.try_admit(Uuid::new_v4()));
    }

    #[test]
    fn test_queue_priority_then_fifo() {
        let rm = monitor(1, 10, Arc::new(FixedSampler::default()));
        let [low, high_a, high_b, mid] = [(); 4].map(|_| Uuid::new_v4());

        assert!(rm.enqueue(low, 1));
        assert!(rm.enqueue(high_a, 5));
        assert!(rm.enqueue(mid, 3));
        assert!(rm.enqueue(high_b, 5));

        assert_eq!(rm.dequeue(), Some(high_a));
        assert_eq!(rm.dequeue(), Some(high_b));
        assert_eq!(rm.dequeue(), Some(mid));
        assert_eq!(rm.dequeue(), Some(low));
        assert_eq!(rm.dequeue(), None);
    }

    #[test]
    fn test_queue_is_bounded() {
        let rm = monitor(1, 2, Arc::new(FixedSampler::default()));
        assert!(rm.enqueue(Uuid::new_v4(), 0));
        assert!(rm.enqueue(Uuid::new_v4(), 0));
        assert!(!rm.enqueue(Uuid::new_v4(), 9));
        assert_eq!(rm.queue_len(), 2);
    }

    #[test]
    fn test_invalid_limits() {
        let sampler: Arc<dyn ResourceSampler> = Arc::new(FixedSampler::default());
        let limits = ResourceLimits {
            max_concurrent_checks: 0,
            ..ResourceLimits::default()
        };
        assert!(ResourceMonitor::new(limits, sampler.clone()).is_err());

        let limits = ResourceLimits {
            max_cpu_percent: 120.0,
            ..ResourceLimits::default()
        };
        assert!(ResourceMonitor::new(limits, sampler).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_turn_after_release() {
        let rm = Arc::new(monitor(1, 10, Arc::new(FixedSampler::default())));
        let holder = Uuid::new_v4();
        assert!(rm.try_admit(holder));

        let waiter = Uuid::new_v4();
        assert!(rm.enqueue(waiter, 1));

        let rm2 = rm.clone();
        let handle =
            tokio::spawn(async move { rm2.wait_for_turn(waiter, Duration::from_secs(5)).await });

        time::sleep(Duration::from_millis(10)).await;
        rm.release(holder);

        assert!(handle.await.unwrap());
        assert_eq!(rm.queue_len(), 0);
        assert_eq!(rm.active_count(), 1);

        // The queued check now holds the slot; a newcomer cannot take it.
        assert!(!rm.try_admit(Uuid::new_v4()));
        rm.release(waiter);
        assert_eq!(rm.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_turn_respects_queue_order() {
        let rm = Arc::new(monitor(1, 10, Arc::new(FixedSampler::default())));
        let holder = Uuid::new_v4();
        assert!(rm.try_admit(holder));

        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(rm.enqueue(first, 1));
        assert!(rm.enqueue(second, 1));

        let rm2 = rm.clone();
        let wait = Duration::from_millis(300);
        let behind = tokio::spawn(async move { rm2.wait_for_turn(second, wait).await });
        time::sleep(Duration::from_millis(10)).await;
        rm.release(holder);

        // `second` is not at the head, so the free slot stays unused until it times out.
        assert!(!behind.await.unwrap());
        assert_eq!(rm.active_count(), 0);
        assert!(rm.remove_pending(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_turn_times_out() {
        let rm = monitor(1, 10, Arc::new(FixedSampler::default()));
        assert!(rm.try_admit(Uuid::new_v4()));

        let waiter = Uuid::new_v4();
        assert!(rm.enqueue(waiter, 1));
        assert!(!rm.wait_for_turn(waiter, Duration::from_millis(200)).await);
        assert_eq!(rm.queue_len(), 0);
    }
}
