//! Node status tracking subsystem.
//!
//! # Data Flow
//! ```text
//! check workflow
//!     → set_status (queued → connecting → running → polling)
//!     → record_completion / record_timeout (single UPDATE, clears session)
//!     → active_check_count feeds admission control
//!     → live_updates feed dashboards
//! ```
//!
//! # Design Decisions
//! - Out-of-order transitions are governed by `TransitionPolicy`: logged
//!   and applied when permissive, rejected with `InvalidState` when strict
//! - Completion counters are updated in the same statement that ends the
//!   check, so readers never see a half-recorded outcome

pub mod live;
pub mod state;
pub mod tracker;

pub use live::LiveUpdate;
pub use state::NodeStatus;
pub use tracker::{NodeStatusRecord, NodeStatusTracker, StaleCheck};
