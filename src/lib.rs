//! Dual-protocol health checking engine.
//!
//! Checks every server in a fleet over two protocols at once (a JSON-RPC
//! capability listing and a plain REST health endpoint) and folds both
//! outcomes into one weighted status and score.

// Core
pub mod config;
pub mod health;
pub mod protocol;

// Shared resources
pub mod resources;
pub mod scheduler;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub mod admin;

pub use config::schema::HealthConfig;
pub use health::{DualCheckOrchestrator, DualCheckResult, HealthError, HealthResult, HealthStatus};
pub use lifecycle::{Engine, Shutdown};
