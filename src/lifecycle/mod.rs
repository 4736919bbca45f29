//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build pools, cache, admission, breakers,
//!     clients, orchestrator → Spawn background loops → Admin API last
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Broadcast stop → Cancel in-flight checks
//!     → Drain batches → Close pools → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Every long-lived object is an explicit instance owned by the engine
//! - Shutdown has timeout: tasks still running after the grace period are aborted

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::Engine;
