//! Request batching subsystem.
//!
//! # Data Flow
//! ```text
//! Check requests (admin API, callers):
//!     → batch.rs add_request (join open batch of same priority, or open one)
//!     → flush loop (full or aged batches, highest priority first)
//!     → mpsc channel → batch consumer → orchestrator check_fleet
//! ```
//!
//! # Design Decisions
//! - Batches are keyed by priority; a batch never mixes priorities
//! - A sealed batch leaves the scheduler; it is never flushed twice
//! - Pending batches are drained, not dropped, on shutdown

pub mod batch;

pub use batch::{Batch, BatchConfig, BatchScheduler};
