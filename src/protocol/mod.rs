//! Protocol probe clients.
//!
//! # Data Flow
//! ```text
//! Orchestrator protocol subtask:
//!     → auth.rs (bearer token, cached per server)
//!     → resources::pool (lease a client slot for the protocol)
//!     → capability.rs (JSON-RPC initialize + tools/list)
//!       or rest.rs (GET health endpoint)
//!     → ProtocolResult (failures classified, never raised)
//! ```
//!
//! # Design Decisions
//! - Clients are trait objects chosen once at construction, not per call
//! - Every outcome is data: a client never returns an error to the orchestrator
//! - Request timeouts come from the target; the overall deadline is the orchestrator's

pub mod auth;
pub mod capability;
pub mod client;
pub mod rest;

pub use auth::{AuthProvider, CachedAuthProvider, EnvTokenProvider};
pub use capability::CapabilityProbeClient;
pub use client::ProbeClient;
pub use rest::RestProbeClient;
