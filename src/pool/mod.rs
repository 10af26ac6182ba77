//! Credential pool subsystem.
//!
//! # Data Flow
//! ```text
//! acquire(session_id)
//!     → poll loop (immediate attempt, then every poll_interval)
//!         → attempt lock (optional, FIFO-fair, one attempt in flight per process)
//!         → BEGIN IMMEDIATE
//!         → pick enabled, unexpired credential with a free slot
//!           (fewest sessions first, then least recently used)
//!         → increment current_sessions, insert ownership row, COMMIT
//!     → Timeout at max_wait or caller deadline, Cancelled on token
//!
//! release(username, session_id)
//!     → delete ownership row → decrement only if a row was deleted
//! ```
//!
//! # Design Decisions
//! - Ownership is a table keyed by session id: one credential per session
//! - Release is idempotent so callers can retry after partial failures
//! - Polling, not notification: releases by other processes are invisible
//!   to this one except through the store

pub mod credential;
pub mod ledger;
pub mod manager;

pub use credential::{Credential, NewCredential, PoolStatus};
pub use ledger::SessionLedger;
pub use manager::CredentialPool;
