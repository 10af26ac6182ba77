//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Store write (acquire attempt, release):
//!     → retries.rs (retry only conflicts, bounded attempts)
//!     → backoff.rs (exponential delay with jitter between attempts)
//!     → surface Conflict once the budget is spent
//! ```
//!
//! # Design Decisions
//! - Only store conflicts are retried; everything else surfaces immediately
//! - Jittered backoff prevents writers retrying in lockstep

pub mod backoff;
pub mod retries;
