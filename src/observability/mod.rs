//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! orchestrator, admission, cache, pools, retries
//!     → logging.rs (tracing events with server/protocol fields)
//!     → metrics.rs (facade counters, gauges, histograms)
//!
//! Exposed through:
//!     → stdout, pretty or JSON
//!     → Prometheus listener (metrics_address)
//!     → /admin/metrics (EngineMetrics snapshot)
//! ```
//!
//! # Design Decisions
//! - RUST_LOG overrides the configured level
//! - Facade calls are no-ops until an exporter is installed, so tests need no setup
//! - Snapshot counters belong to one engine instance, not the process

pub mod logging;
pub mod metrics;
