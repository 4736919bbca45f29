//! Priority-keyed request batching.
//!
//! # Responsibilities
//! - Group incoming check requests into batches of equal priority
//! - Seal batches once full or older than the flush timeout
//! - Hand sealed batches to a consumer from a background loop

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::health::types::{HealthError, HealthResult, ServerTarget};

/// Batching limits.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    max_batch_size: usize,
    flush_timeout: Duration,
    flush_interval: Duration,
}

impl BatchConfig {
    pub fn new(
        max_batch_size: usize,
        flush_timeout: Duration,
        flush_interval: Duration,
    ) -> HealthResult<Self> {
        if max_batch_size == 0 {
            return Err(HealthError::Configuration("max_batch_size must be > 0".into()));
        }
        if flush_interval.is_zero() {
            return Err(HealthError::Configuration("batch flush interval must be > 0".into()));
        }
        Ok(Self {
            max_batch_size,
            flush_timeout,
            flush_interval,
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_timeout: Duration::from_secs(1),
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// A group of targets sharing one priority.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub priority: u32,
    pub targets: Vec<ServerTarget>,
    pub created_at: Instant,
    pub max_size: usize,
    pub flush_timeout: Duration,
}

impl Batch {
    fn open(priority: u32, config: &BatchConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            targets: Vec::with_capacity(config.max_batch_size),
            created_at: Instant::now(),
            max_size: config.max_batch_size,
            flush_timeout: config.flush_timeout,
        }
    }

    pub fn is_full(&self) -> bool {
        self.targets.len() >= self.max_size
    }

    pub fn is_aged(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.flush_timeout
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Accumulates check requests into batches.
#[derive(Debug)]
pub struct BatchScheduler {
    config: BatchConfig,
    pending: Mutex<Vec<Batch>>,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Add a target to an open batch of the same priority with spare room,
    /// or open a new batch. Returns the batch id.
    pub fn add_request(&self, target: ServerTarget, priority: u32) -> Uuid {
        let mut pending = self.pending.lock().expect("batch scheduler mutex poisoned");

        if let Some(batch) = pending
            .iter_mut()
            .find(|b| b.priority == priority && !b.is_full())
        {
            batch.targets.push(target);
            return batch.id;
        }

        let mut batch = Batch::open(priority, &self.config);
        batch.targets.push(target);
        let id = batch.id;
        tracing::debug!(batch_id = %id, priority, "Opened batch");
        pending.push(batch);
        id
    }

    /// Remove and return every full or aged batch, highest priority first.
    pub fn flush(&self) -> Vec<Batch> {
        let now = Instant::now();
        let mut pending = self.pending.lock().expect("batch scheduler mutex poisoned");

        let (ready, open): (Vec<Batch>, Vec<Batch>) = pending
            .drain(..)
            .partition(|b| b.is_full() || b.is_aged(now));
        *pending = open;
        drop(pending);

        sorted_by_priority(ready)
    }

    /// Remove and return every pending batch regardless of readiness.
    pub fn drain(&self) -> Vec<Batch> {
        let mut pending = self.pending.lock().expect("batch scheduler mutex poisoned");
        let drained = std::mem::take(&mut *pending);
        drop(pending);
        sorted_by_priority(drained)
    }

    /// Number of open batches.
    pub fn pending_batches(&self) -> usize {
        self.pending.lock().expect("batch scheduler mutex poisoned").len()
    }

    /// Number of queued targets across open batches.
    pub fn pending_requests(&self) -> usize {
        self.pending
            .lock()
            .expect("batch scheduler mutex poisoned")
            .iter()
            .map(Batch::len)
            .sum()
    }

    /// Flush on the configured interval, sending ready batches to `tx`.
    /// Drains everything left on shutdown.
    pub async fn run(&self, tx: mpsc::Sender<Batch>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.config.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for batch in self.flush() {
                        tracing::debug!(
                            batch_id = %batch.id,
                            priority = batch.priority,
                            size = batch.len(),
                            "Flushing batch"
                        );
                        if tx.send(batch).await.is_err() {
                            tracing::warn!("Batch consumer gone, stopping scheduler");
                            return;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Batch scheduler received shutdown signal, draining");
                    for batch in self.drain() {
                        if tx.send(batch).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    }
}

// Stable sort keeps creation order among equal priorities.
fn sorted_by_priority(mut batches: Vec<Batch>) -> Vec<Batch> {
    batches.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    batches
}
