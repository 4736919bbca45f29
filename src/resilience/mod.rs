//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Dual check for one server:
//!     → circuit_breaker.rs (read state: skip, partial, or full check)
//!     → timeouts.rs (overall deadline = max protocol timeout + buffer)
//!     → retries.rs (per-protocol re-invoke on connection/timeout errors,
//!                   whole-check retry while not successful)
//!     → backoff.rs (delay between attempts)
//!
//! After a fleet cycle:
//!     results → circuit_breaker.rs BreakerBook::record
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every probe has a deadline
//! - A deadline always wins over a retry; retries follow completed attempts only
//! - Breaker state is read-only to the orchestrator; only the fleet monitor writes it

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerBook, BreakerConfig, CircuitBreakerRegistry, CircuitBreakerState};
pub use retries::RetryPolicy;
