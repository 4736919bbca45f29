//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Fleet monitor (monitor.rs):
//!     Periodic timer or scheduler batch
//!     → orchestrator.rs check_fleet
//!     → Record into breaker book + result cache
//!
//! Orchestrator (orchestrator.rs):
//!     Breaker state → admission → dispatch slot
//!     → capability + REST probes in parallel, under deadline
//!     → aggregator.rs combine
//!
//! Aggregator (aggregator.rs):
//!     (capability?, rest?, config) → DualCheckResult
//! ```
//!
//! # Design Decisions
//! - Two protocols per server are complementary; one failing never aborts the other
//! - Aggregation is a pure function, testable without any I/O
//! - Health state is per-server, carried in immutable results

pub mod aggregator;
pub mod monitor;
pub mod orchestrator;
pub mod types;

pub use aggregator::{combine, AggregationConfig, PriorityConfig, ScoreMethod};
pub use monitor::{FleetMonitor, FleetSummary};
pub use orchestrator::{Collaborators, DualCheckOrchestrator, OrchestratorConfig};
pub use types::{
    DualCheckResult, HealthError, HealthResult, HealthStatus, ProtocolResult, ServerTarget,
};
