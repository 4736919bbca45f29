//! Multi-category TTL cache.
//!
//! # Responsibilities
//! - Hold configuration, auth token, DNS and check-result entries
//! - Expire entries at `created_at + ttl` (lazily on read, eagerly by sweep)
//! - Keep each category within its size bound by evicting the
//!   least-recently-accessed 10%
//!
//! # Design Decisions
//! - One lock per category; categories never affect each other
//! - Times come from `tokio::time::Instant` so tests can drive expiry

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::health::types::{DualCheckResult, HealthError, HealthResult};
use crate::observability::metrics;

/// Cache categories. Each has its own TTL and size bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Configuration,
    AuthTokens,
    Dns,
    CheckResults,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 4] = [
        CacheCategory::Configuration,
        CacheCategory::AuthTokens,
        CacheCategory::Dns,
        CacheCategory::CheckResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Configuration => "configuration",
            CacheCategory::AuthTokens => "auth_tokens",
            CacheCategory::Dns => "dns",
            CacheCategory::CheckResults => "check_results",
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Token(String),
    CheckResult(Box<DualCheckResult>),
}

/// TTL and size bound of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub categories: HashMap<CacheCategory, CategoryConfig>,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let categories = HashMap::from([
            (
                CacheCategory::Configuration,
                CategoryConfig { ttl: Duration::from_secs(300), max_entries: 100 },
            ),
            (
                CacheCategory::AuthTokens,
                CategoryConfig { ttl: Duration::from_secs(3000), max_entries: 1000 },
            ),
            (
                CacheCategory::Dns,
                CategoryConfig { ttl: Duration::from_secs(300), max_entries: 1000 },
            ),
            (
                CacheCategory::CheckResults,
                CategoryConfig { ttl: Duration::from_secs(60), max_entries: 1000 },
            ),
        ]);
        Self {
            categories,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    created_at: Instant,
    expires_at: Instant,
    last_accessed_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct CategoryStore {
    config: CategoryConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Per-category statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStats {
    pub category: CacheCategory,
    pub total: usize,
    pub expired: usize,
    pub valid: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Category-isolated TTL cache.
#[derive(Debug)]
pub struct CacheManager {
    stores: HashMap<CacheCategory, CategoryStore>,
    sweep_interval: Duration,
}

impl CacheManager {
    /// Create a cache. Every category must be configured with a non-zero TTL and size.
    pub fn new(config: CacheConfig) -> HealthResult<Self> {
        let mut stores = HashMap::new();
        for category in CacheCategory::ALL {
            let cfg = config.categories.get(&category).copied().ok_or_else(|| {
                HealthError::Configuration(format!("cache category '{category}' is not configured"))
            })?;
            if cfg.ttl.is_zero() || cfg.max_entries == 0 {
                return Err(HealthError::Configuration(format!(
                    "cache category '{category}' needs ttl > 0 and max_entries > 0"
                )));
            }
            stores.insert(
                category,
                CategoryStore {
                    config: cfg,
                    entries: Mutex::new(HashMap::new()),
                    hits: AtomicU64::new(0),
                    misses: AtomicU64::new(0),
                },
            );
        }
        if config.sweep_interval.is_zero() {
            return Err(HealthError::Configuration("cache sweep interval must be > 0".into()));
        }

        Ok(Self {
            stores,
            sweep_interval: config.sweep_interval,
        })
    }

    fn store(&self, category: CacheCategory) -> &CategoryStore {
        // Every category is inserted by `new`.
        &self.stores[&category]
    }

    /// Look up a value, refreshing its access time. Expired entries are removed.
    pub fn get(&self, category: CacheCategory, key: &str) -> Option<CachedValue> {
        let store = self.store(category);
        let now = Instant::now();
        let mut entries = store.entries.lock().expect("cache mutex poisoned");

        let found = match entries.get(key).map(|e| e.is_expired(now)) {
            Some(true) => {
                entries.remove(key);
                None
            }
            Some(false) => entries.get_mut(key).map(|entry| {
                entry.last_accessed_at = now;
                entry.value.clone()
            }),
            None => None,
        };
        drop(entries);

        let counter = if found.is_some() { &store.hits } else { &store.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup(category, found.is_some());
        found
    }

    /// Insert a value with the category TTL, or `ttl` when given.
    pub fn set(
        &self,
        category: CacheCategory,
        key: impl Into<String>,
        value: CachedValue,
        ttl: Option<Duration>,
    ) {
        let store = self.store(category);
        let key = key.into();
        let now = Instant::now();
        let ttl = ttl.unwrap_or(store.config.ttl);
        let mut entries = store.entries.lock().expect("cache mutex poisoned");

        if !entries.contains_key(&key) && entries.len() >= store.config.max_entries {
            let evicted = evict_least_recent(&mut entries, store.config.max_entries);
            tracing::debug!(category = %category, evicted, "Cache category full, evicted entries");
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                last_accessed_at: now,
            },
        );
    }

    /// Remove one entry.
    pub fn invalidate(&self, category: CacheCategory, key: &str) -> bool {
        self.store(category)
            .entries
            .lock()
            .expect("cache mutex poisoned")
            .remove(key)
            .is_some()
    }

    /// Remove expired entries from every category. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for store in self.stores.values() {
            let mut entries = store.entries.lock().expect("cache mutex poisoned");
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            removed += before - entries.len();
        }
        removed
    }

    /// Per-category totals, ordered like [`CacheCategory::ALL`].
    pub fn stats(&self) -> Vec<CategoryStats> {
        let now = Instant::now();
        CacheCategory::ALL
            .into_iter()
            .map(|category| {
                let store = self.store(category);
                let entries = store.entries.lock().expect("cache mutex poisoned");
                let expired = entries.values().filter(|e| e.is_expired(now)).count();
                CategoryStats {
                    category,
                    total: entries.len(),
                    expired,
                    valid: entries.len() - expired,
                    max_entries: store.config.max_entries,
                    hits: store.hits.load(Ordering::Relaxed),
                    misses: store.misses.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Hit rate across all categories (0 when nothing was looked up).
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.stores.values().fold((0u64, 0u64), |(h, m), s| {
            (h + s.hits.load(Ordering::Relaxed), m + s.misses.load(Ordering::Relaxed))
        });
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    /// Periodic expiry sweep until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.sweep_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.purge_expired();
                    if removed > 0 {
                        tracing::debug!(removed, "Cache sweep removed expired entries");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Cache sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Evict the least-recently-accessed 10% (at least one entry).
fn evict_least_recent(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) -> usize {
    let count = max_entries.div_ceil(10).max(1).min(entries.len());
    let mut by_access: Vec<(Instant, Instant, String)> = entries
        .iter()
        .map(|(k, e)| (e.last_accessed_at, e.created_at, k.clone()))
        .collect();
    by_access.sort();
    for (_, _, key) in by_access.into_iter().take(count) {
        entries.remove(&key);
    }
    count
}
