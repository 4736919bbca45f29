//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! dual-health.toml
//!     → loader.rs (toml → HealthConfig, serde defaults fill gaps)
//!     → validation.rs (every semantic problem collected)
//!     → schema.rs conversions (ServerTarget, AggregationConfig, ResourceLimits, ...)
//!     → Engine
//!
//! File modified (watcher.rs):
//!     reload + revalidate → mpsc → FleetMonitor replaces targets
//!     invalid file → logged, previous config kept
//! ```
//!
//! # Design Decisions
//! - Only the server list is hot-swapped; engine-wide limits need a restart
//! - Every section is optional so a file can list servers and nothing else
//! - Domain constructors validate again; invalid values never become silent defaults

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{HealthConfig, ObservabilityConfig, ServerConfig};
pub use watcher::ConfigWatcher;
