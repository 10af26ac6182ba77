//! Recovery of checks and credential holds abandoned by a crash or a lost task.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::config::SharedConfig;
use crate::error::HcResult;
use crate::pool::CredentialPool;
use crate::status::NodeStatusTracker;

/// What one sweep cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Nodes moved from an in-progress state to `timeout`.
    pub nodes_timed_out: Vec<String>,
    /// Sessions whose credential hold was released.
    pub sessions_released: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.nodes_timed_out.is_empty() && self.sessions_released.is_empty()
    }
}

pub struct StaleSessionReaper {
    pool: Arc<CredentialPool>,
    tracker: NodeStatusTracker,
    config: SharedConfig,
}

impl StaleSessionReaper {
    pub fn new(pool: Arc<CredentialPool>, tracker: NodeStatusTracker, config: SharedConfig) -> Self {
        Self {
            pool,
            tracker,
            config,
        }
    }

    /// One sweep.
    ///
    /// In-progress nodes untouched for `stale_after` are timed out and their
    /// session released. Credential holds older than `stale_after` whose
    /// session no longer drives any in-progress node are released too.
    pub async fn reap_once(&self) -> HcResult<ReapReport> {
        let stale_after = self.config.load().checks.stale_after();
        let mut report = ReapReport::default();

        for stale in self.tracker.stale_checks(stale_after).await? {
            let session_id = stale.session_id.clone().unwrap_or_default();
            let message = format!(
                "abandoned in {} for over {} s",
                stale.status,
                stale_after.as_secs()
            );
            self.tracker
                .record_timeout(
                    &stale.node_id,
                    &session_id,
                    stale_after.as_millis() as u64,
                    Some(&message),
                )
                .await?;
            tracing::warn!(node_id = %stale.node_id, session_id = %session_id, status = %stale.status, "Reaped stale check");
            report.nodes_timed_out.push(stale.node_id);

            if !session_id.is_empty() {
                if let Some(username) = self.pool.release_session(&session_id).await? {
                    tracing::warn!(session_id = %session_id, username = %username, "Released credential held by stale check");
                    report.sessions_released.push(session_id);
                }
            }
        }

        let live = self.tracker.in_progress_sessions().await?;
        for (session_id, username) in self.pool.sessions_held_longer_than(stale_after).await? {
            if live.contains(&session_id) {
                continue;
            }
            if self.pool.release(&username, &session_id).await? {
                tracing::warn!(session_id = %session_id, username = %username, "Released orphaned credential hold");
                report.sessions_released.push(session_id);
            }
        }

        if !report.is_empty() {
            tracing::info!(
                nodes = report.nodes_timed_out.len(),
                sessions = report.sessions_released.len(),
                "Reaper sweep cleaned up"
            );
        }
        Ok(report)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let interval = self.config.load().checks.reap_interval();
        tracing::info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = self.config.load().checks.stale_after_secs,
            "Stale session reaper starting"
        );

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        tracing::error!(error = %e, "Reaper sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Reaper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
