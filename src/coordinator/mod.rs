//! Check coordination subsystem.
//!
//! # Data Flow
//! ```text
//! scheduler tick
//!     → active_check_count < max_concurrent_checks ?
//!     → inventory.nodes_due_for_check(free slots)
//!     → per node: queued, then one tokio task
//!         → pool.acquire_with_cancel        (Timeout / NotFound → deferred, idle)
//!         → connecting → proxy failover     (no proxy → deferred, idle)
//!         → running → executor.run          (executor may move to polling)
//!         → record_completion / record_timeout
//!         → pool.release                    (every path)
//!
//! reaper tick
//!     → stale in-progress nodes → timeout + release_session
//!     → orphaned credential holds → release
//! ```
//!
//! # Design Decisions
//! - The executor is a trait object; no check protocol lives in this crate
//! - A node is queued before its task is spawned, so admission never
//!   overshoots and the inventory never offers it twice
//! - Shutdown cancels waiting acquisitions immediately and lets running
//!   checks record their outcome before exit

pub mod executor;
pub mod reaper;
pub mod scheduler;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::pool::CredentialPool;
use crate::status::NodeStatusTracker;

pub use executor::{CheckContext, CheckError, CheckExecutor, CheckTarget, ProgressReporter};
pub use reaper::{ReapReport, StaleSessionReaper};
pub use scheduler::CheckScheduler;
pub use workflow::{CheckOutcome, CheckWorkflow};

/// Refresh pool and active-check gauges on an interval until shutdown.
pub async fn publish_gauges(
    pool: Arc<CredentialPool>,
    tracker: NodeStatusTracker,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Both calls record their gauges as a side effect.
                match (pool.pool_status().await, tracker.active_check_count().await) {
                    (Ok(status), Ok(active)) => tracing::debug!(
                        used = status.used_capacity,
                        available = status.available_capacity,
                        active,
                        "Gauges refreshed"
                    ),
                    (Err(e), _) | (_, Err(e)) => tracing::warn!(error = %e, "Gauge refresh failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Gauge publisher received shutdown signal, exiting loop");
                break;
            }
        }
    }
}
