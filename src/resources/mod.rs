//! Resource governance subsystem.
//!
//! # Data Flow
//! ```text
//! Check about to run:
//!     → admission.rs (in-flight ceiling, memory/CPU pressure, pending queue)
//!     → pool.rs (per-protocol client + connection slot)
//!     → cache.rs (auth tokens, latest results)
//!
//! Background (one task each, stopped by the shutdown broadcast):
//!     pool sweep → drop idle clients
//!     cache sweep → drop expired entries
//!     resource sampler → refresh memory/CPU usage
//! ```
//!
//! # Design Decisions
//! - Every structure owns its own lock; nothing shares a mutex
//! - Capability and REST pools never block each other
//! - Instances are explicit and injected, no process-wide singletons

pub mod admission;
pub mod cache;
pub mod pool;

pub use admission::{ResourceLimits, ResourceMonitor};
pub use cache::{CacheCategory, CacheManager, CachedValue};
pub use pool::{ConnectionPoolManager, PoolConfig, PoolLease};
