//! Per-node check state, counters and progress feed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use crate::config::{SharedConfig, TransitionPolicy};
use crate::error::{HcError, HcResult};
use crate::observability::metrics;
use crate::pool::credential::parse_timestamp;
use crate::resilience::retries::{retry_on_conflict, RetryPolicy};
use crate::status::live::{insert_update, updates_for_session, LiveUpdate};
use crate::status::state::NodeStatus;
use crate::store::{now_timestamp, Database};

/// Persisted view of one node's check history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatusRecord {
    pub node_id: String,
    pub status: NodeStatus,
    pub current_session_id: Option<String>,
    pub current_username: Option<String>,
    pub last_check_started: Option<DateTime<Utc>>,
    pub last_check_completed: Option<DateTime<Utc>>,
    pub last_check_duration_ms: Option<u64>,
    pub last_check_result: Option<String>,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub consecutive_failures: u64,
    pub last_successful_check: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// An in-progress check that has not been touched recently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleCheck {
    pub node_id: String,
    pub status: NodeStatus,
    pub session_id: Option<String>,
    pub username: Option<String>,
}

/// How a check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    TimedOut,
}

impl Outcome {
    fn status(self) -> NodeStatus {
        match self {
            Outcome::Success => NodeStatus::Completed,
            Outcome::Failure => NodeStatus::Failed,
            Outcome::TimedOut => NodeStatus::Timeout,
        }
    }

    fn result(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failed",
            Outcome::TimedOut => "timeout",
        }
    }
}

const RECORD_COLUMNS: &str = "node_id, current_status, current_session_id, current_username,
    last_check_started, last_check_completed, last_check_duration, last_check_result,
    total_checks, successful_checks, consecutive_failures, last_successful_check,
    error_message, updated_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<NodeStatusRecord> {
    Ok(NodeStatusRecord {
        node_id: row.get(0)?,
        status: row.get(1)?,
        current_session_id: row.get(2)?,
        current_username: row.get(3)?,
        last_check_started: parse_timestamp(row.get(4)?),
        last_check_completed: parse_timestamp(row.get(5)?),
        last_check_duration_ms: row.get(6)?,
        last_check_result: row.get(7)?,
        total_checks: row.get(8)?,
        successful_checks: row.get(9)?,
        consecutive_failures: row.get(10)?,
        last_successful_check: parse_timestamp(row.get(11)?),
        error_message: row.get(12)?,
        updated_at: parse_timestamp(row.get(13)?),
    })
}

fn store_err(op: &'static str) -> impl Fn(rusqlite::Error) -> HcError {
    move |e| HcError::from_store(op, e)
}

/// Current state and session of a node, or `NotFound`.
fn current_state(
    conn: &Connection,
    op: &'static str,
    node_id: &str,
) -> HcResult<(NodeStatus, Option<String>)> {
    conn.query_row(
        "SELECT current_status, current_session_id FROM node_status WHERE node_id = ?1",
        params![node_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(store_err(op))?
    .ok_or_else(|| HcError::NotFound(format!("node {}", node_id)))
}

fn check_transition(
    policy: TransitionPolicy,
    node_id: &str,
    from: NodeStatus,
    to: NodeStatus,
) -> HcResult<()> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    match policy {
        TransitionPolicy::Strict => Err(HcError::InvalidState(format!(
            "node {} cannot move from {} to {}",
            node_id, from, to
        ))),
        TransitionPolicy::Permissive => {
            tracing::warn!(node_id, from = %from, to = %to, "Applying out-of-order status transition");
            Ok(())
        }
    }
}

/// Records each node's check lifecycle and exposes the live in-progress count.
///
/// The transition policy and conflict retry budget are read from the live
/// config on every write, so a reload applies to the next transition.
#[derive(Debug, Clone)]
pub struct NodeStatusTracker {
    db: Database,
    config: SharedConfig,
}

impl NodeStatusTracker {
    pub fn new(db: Database, config: SharedConfig) -> Self {
        Self { db, config }
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.config.load().status.transition_policy
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.load().pool)
    }

    /// Create an idle status row for `node_id` if none exists.
    pub async fn ensure_node(&self, node_id: &str) -> HcResult<()> {
        let node = node_id.to_string();
        self.db
            .call("ensure_node", move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO node_status (node_id, current_status, updated_at)
                     VALUES (?1, 'idle', ?2)",
                    params![node, now_timestamp()],
                )
                .map(|_| ())
            })
            .await
    }

    /// Move a node to `status`.
    ///
    /// Session and username are stored only for in-progress states and
    /// cleared otherwise. Entering `running` stamps the check start time.
    pub async fn set_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        session_id: Option<&str>,
        username: Option<&str>,
    ) -> HcResult<()> {
        let (session, user) = if status.is_in_progress() {
            (session_id.map(str::to_string), username.map(str::to_string))
        } else {
            (None, None)
        };
        let policy = self.policy();

        let previous = retry_on_conflict("set_status", self.retry(), || {
            let node = node_id.to_string();
            let session = session.clone();
            let user = user.clone();
            self.db.call_with("set_status", move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(store_err("set_status"))?;
                let (from, _) = current_state(&tx, "set_status", &node)?;
                check_transition(policy, &node, from, status)?;

                let now = now_timestamp();
                tx.execute(
                    "UPDATE node_status
                     SET current_status = ?1,
                         current_session_id = ?2,
                         current_username = ?3,
                         last_check_started = CASE WHEN ?1 = 'running' THEN ?4 ELSE last_check_started END,
                         updated_at = ?4
                     WHERE node_id = ?5",
                    params![status, session, user, now, node],
                )
                .map_err(store_err("set_status"))?;
                tx.commit().map_err(store_err("set_status"))?;
                Ok(from)
            })
        })
        .await?;

        tracing::debug!(node_id, from = %previous, to = %status, session_id, "Node status updated");
        Ok(())
    }

    /// Close a check with its outcome in a single update.
    ///
    /// Increments `total_checks`, and on success `successful_checks`;
    /// failures extend `consecutive_failures`, success resets it. The
    /// node's session and username are cleared.
    pub async fn record_completion(
        &self,
        node_id: &str,
        session_id: &str,
        success: bool,
        duration_ms: u64,
        error_message: Option<&str>,
    ) -> HcResult<()> {
        let outcome = if success { Outcome::Success } else { Outcome::Failure };
        self.finish(node_id, session_id, outcome, duration_ms, error_message)
            .await
    }

    /// Close a check that ran out of time.
    pub async fn record_timeout(
        &self,
        node_id: &str,
        session_id: &str,
        duration_ms: u64,
        message: Option<&str>,
    ) -> HcResult<()> {
        let message = message.unwrap_or("check timed out");
        self.finish(node_id, session_id, Outcome::TimedOut, duration_ms, Some(message))
            .await
    }

    async fn finish(
        &self,
        node_id: &str,
        session_id: &str,
        outcome: Outcome,
        duration_ms: u64,
        error_message: Option<&str>,
    ) -> HcResult<()> {
        let policy = self.policy();
        let error_message = error_message.map(str::to_string);

        retry_on_conflict("record_completion", self.retry(), || {
            let node = node_id.to_string();
            let session = session_id.to_string();
            let error_message = error_message.clone();
            self.db.call_with("record_completion", move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(store_err("record_completion"))?;
                let (from, holder) = current_state(&tx, "record_completion", &node)?;
                check_transition(policy, &node, from, outcome.status())?;
                if let Some(holder) = holder.filter(|h| *h != session) {
                    match policy {
                        TransitionPolicy::Strict => {
                            return Err(HcError::InvalidState(format!(
                                "node {} is held by session {}, not {}",
                                node, holder, session
                            )))
                        }
                        TransitionPolicy::Permissive => tracing::warn!(
                            node_id = %node,
                            holder = %holder,
                            session_id = %session,
                            "Completing check for a session that no longer owns the node"
                        ),
                    }
                }

                let success = outcome == Outcome::Success;
                tx.execute(
                    "UPDATE node_status
                     SET current_status = ?1,
                         last_check_completed = ?2,
                         last_check_duration = ?3,
                         last_check_result = ?4,
                         total_checks = total_checks + 1,
                         successful_checks = successful_checks + CASE WHEN ?5 THEN 1 ELSE 0 END,
                         consecutive_failures = CASE WHEN ?5 THEN 0 ELSE consecutive_failures + 1 END,
                         last_successful_check = CASE WHEN ?5 THEN ?2 ELSE last_successful_check END,
                         error_message = ?6,
                         current_session_id = NULL,
                         current_username = NULL,
                         updated_at = ?2
                     WHERE node_id = ?7",
                    params![
                        outcome.status(),
                        now_timestamp(),
                        duration_ms,
                        outcome.result(),
                        success,
                        error_message,
                        node
                    ],
                )
                .map_err(store_err("record_completion"))?;
                tx.commit().map_err(store_err("record_completion"))
            })
        })
        .await?;

        metrics::record_check_completed(outcome.result());
        tracing::info!(
            node_id,
            session_id,
            result = outcome.result(),
            duration_ms,
            error = error_message.as_deref().unwrap_or(""),
            "Check finished"
        );
        Ok(())
    }

    /// Return a finished node to `idle`.
    pub async fn mark_idle(&self, node_id: &str) -> HcResult<()> {
        self.set_status(node_id, NodeStatus::Idle, None, None).await
    }

    pub async fn get_status(&self, node_id: &str) -> HcResult<NodeStatus> {
        let node = node_id.to_string();
        self.db
            .call_with("get_status", move |conn| {
                current_state(conn, "get_status", &node).map(|(status, _)| status)
            })
            .await
    }

    pub async fn node_record(&self, node_id: &str) -> HcResult<NodeStatusRecord> {
        let node = node_id.to_string();
        self.db
            .call("node_record", move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM node_status WHERE node_id = ?1", RECORD_COLUMNS),
                    params![node],
                    record_from_row,
                )
                .optional()
            })
            .await?
            .ok_or_else(|| HcError::NotFound(format!("node {}", node_id)))
    }

    /// Nodes in `queued`, `connecting`, `running` or `polling`.
    pub async fn active_check_count(&self) -> HcResult<u64> {
        let count = self
            .db
            .call("active_check_count", |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM node_status
                     WHERE current_status IN ('queued', 'connecting', 'running', 'polling')",
                    [],
                    |row| row.get::<_, u64>(0),
                )
            })
            .await?;
        metrics::record_active_checks(count);
        Ok(count)
    }

    /// In-progress checks whose status has not changed for `older_than`.
    pub async fn stale_checks(&self, older_than: std::time::Duration) -> HcResult<Vec<StaleCheck>> {
        let age = chrono::Duration::from_std(older_than).map_err(|e| {
            HcError::Config(format!("stale threshold out of range: {}", e))
        })?;
        let cutoff = (Utc::now() - age).to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        self.db
            .call("stale_checks", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT node_id, current_status, current_session_id, current_username
                     FROM node_status
                     WHERE current_status IN ('queued', 'connecting', 'running', 'polling')
                       AND (updated_at IS NULL OR updated_at < ?1)
                     ORDER BY updated_at ASC",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| {
                    Ok(StaleCheck {
                        node_id: row.get(0)?,
                        status: row.get(1)?,
                        session_id: row.get(2)?,
                        username: row.get(3)?,
                    })
                })?;
                let stale = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(stale)
            })
            .await
    }

    /// Session ids currently attached to in-progress nodes.
    pub async fn in_progress_sessions(&self) -> HcResult<HashSet<String>> {
        self.db
            .call("in_progress_sessions", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT current_session_id FROM node_status
                     WHERE current_status IN ('queued', 'connecting', 'running', 'polling')
                       AND current_session_id IS NOT NULL",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<HashSet<_>>>()
            })
            .await
    }

    /// Append a progress entry. Percentages above 100 are clamped.
    pub async fn append_live_update(
        &self,
        session_id: &str,
        node_id: &str,
        status: &str,
        message: &str,
        progress: u8,
    ) -> HcResult<()> {
        let (session, node, status, message) = (
            session_id.to_string(),
            node_id.to_string(),
            status.to_string(),
            message.to_string(),
        );
        self.db
            .call("append_live_update", move |conn| {
                insert_update(conn, &session, &node, &status, &message, progress, &now_timestamp())
                    .map(|_| ())
            })
            .await
    }

    /// Progress entries for a session, oldest first.
    pub async fn live_updates(&self, session_id: &str) -> HcResult<Vec<LiveUpdate>> {
        let session = session_id.to_string();
        self.db
            .call("live_updates", move |conn| updates_for_session(conn, &session))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{shared, CoordinatorConfig};

    fn config_with(policy: TransitionPolicy) -> SharedConfig {
        let mut config = CoordinatorConfig::default();
        config.status.transition_policy = policy;
        shared(config)
    }

    async fn tracker(policy: TransitionPolicy) -> NodeStatusTracker {
        let tracker = NodeStatusTracker::new(Database::open_in_memory().unwrap(), config_with(policy));
        tracker.ensure_node("n1").await.unwrap();
        tracker
    }

    async fn drive_to_running(tracker: &NodeStatusTracker, session: &str) {
        for status in [NodeStatus::Queued, NodeStatus::Connecting, NodeStatus::Running] {
            tracker
                .set_status("n1", status, Some(session), Some("alice"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_completion_clears_session() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        drive_to_running(&tracker, "s1").await;

        tracker
            .record_completion("n1", "s1", false, 500, Some("conn refused"))
            .await
            .unwrap();

        let record = tracker.node_record("n1").await.unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.last_check_result.as_deref(), Some("failed"));
        assert_eq!(record.error_message.as_deref(), Some("conn refused"));
        assert_eq!(record.last_check_duration_ms, Some(500));
        assert_eq!(record.current_session_id, None);
        assert_eq!(record.current_username, None);
        assert_eq!(record.total_checks, 1);
        assert_eq!(record.successful_checks, 0);
        assert_eq!(record.consecutive_failures, 1);
        assert!(record.last_check_started.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        drive_to_running(&tracker, "s1").await;
        tracker.record_completion("n1", "s1", false, 10, Some("boom")).await.unwrap();
        tracker.mark_idle("n1").await.unwrap();

        drive_to_running(&tracker, "s2").await;
        tracker.record_completion("n1", "s2", true, 20, None).await.unwrap();

        let record = tracker.node_record("n1").await.unwrap();
        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.total_checks, 2);
        assert_eq!(record.successful_checks, 1);
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_successful_check.is_some());
        assert_eq!(record.error_message, None);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_successful_check() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        drive_to_running(&tracker, "s1").await;
        tracker.record_completion("n1", "s1", true, 20, None).await.unwrap();
        let succeeded = tracker.node_record("n1").await.unwrap().last_successful_check;
        assert!(succeeded.is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        drive_to_running(&tracker, "s2").await;
        tracker
            .record_completion("n1", "s2", false, 30, Some("auth failed"))
            .await
            .unwrap();

        let record = tracker.node_record("n1").await.unwrap();
        assert_eq!(record.last_successful_check, succeeded);
        assert!(record.last_check_completed > succeeded);
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.successful_checks, 1);
        assert_eq!(record.total_checks, 2);
    }

    #[tokio::test]
    async fn test_session_stored_only_while_in_progress() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        tracker
            .set_status("n1", NodeStatus::Queued, Some("s1"), Some("alice"))
            .await
            .unwrap();
        let record = tracker.node_record("n1").await.unwrap();
        assert_eq!(record.current_session_id.as_deref(), Some("s1"));
        assert_eq!(record.last_check_started, None);

        tracker
            .set_status("n1", NodeStatus::Idle, Some("s1"), Some("alice"))
            .await
            .unwrap();
        let record = tracker.node_record("n1").await.unwrap();
        assert_eq!(record.current_session_id, None);
        assert_eq!(record.current_username, None);
    }

    #[tokio::test]
    async fn test_strict_policy_rejects_skips() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        let err = tracker
            .set_status("n1", NodeStatus::Running, Some("s1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HcError::InvalidState(_)));
        assert_eq!(tracker.get_status("n1").await.unwrap(), NodeStatus::Idle);

        let err = tracker.record_completion("n1", "s1", true, 1, None).await.unwrap_err();
        assert!(matches!(err, HcError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_permissive_policy_applies_skips() {
        let tracker = tracker(TransitionPolicy::Permissive).await;
        tracker
            .set_status("n1", NodeStatus::Running, Some("s1"), None)
            .await
            .unwrap();
        assert_eq!(tracker.get_status("n1").await.unwrap(), NodeStatus::Running);
    }

    #[tokio::test]
    async fn test_policy_change_applies_to_next_transition() {
        let config = config_with(TransitionPolicy::Strict);
        let tracker = NodeStatusTracker::new(Database::open_in_memory().unwrap(), config.clone());
        tracker.ensure_node("n1").await.unwrap();
        assert!(tracker
            .set_status("n1", NodeStatus::Running, Some("s1"), None)
            .await
            .is_err());

        let mut reloaded = (**config.load()).clone();
        reloaded.status.transition_policy = TransitionPolicy::Permissive;
        config.store(Arc::new(reloaded));

        assert_eq!(tracker.policy(), TransitionPolicy::Permissive);
        tracker
            .set_status("n1", NodeStatus::Running, Some("s1"), None)
            .await
            .unwrap();
        assert_eq!(tracker.get_status("n1").await.unwrap(), NodeStatus::Running);
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found() {
        let tracker = tracker(TransitionPolicy::Permissive).await;
        assert!(matches!(
            tracker.get_status("ghost").await.unwrap_err(),
            HcError::NotFound(_)
        ));
        assert!(matches!(
            tracker
                .set_status("ghost", NodeStatus::Queued, None, None)
                .await
                .unwrap_err(),
            HcError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_active_check_count_tracks_in_progress_states() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        for node in ["n2", "n3"] {
            tracker.ensure_node(node).await.unwrap();
        }
        assert_eq!(tracker.active_check_count().await.unwrap(), 0);

        tracker.set_status("n1", NodeStatus::Queued, Some("s1"), None).await.unwrap();
        tracker.set_status("n2", NodeStatus::Queued, Some("s2"), None).await.unwrap();
        assert_eq!(tracker.active_check_count().await.unwrap(), 2);

        tracker.set_status("n2", NodeStatus::Timeout, None, None).await.unwrap();
        assert_eq!(tracker.active_check_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_timeout_sets_result() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        drive_to_running(&tracker, "s1").await;
        tracker.record_timeout("n1", "s1", 9_000, None).await.unwrap();

        let record = tracker.node_record("n1").await.unwrap();
        assert_eq!(record.status, NodeStatus::Timeout);
        assert_eq!(record.last_check_result.as_deref(), Some("timeout"));
        assert_eq!(record.error_message.as_deref(), Some("check timed out"));
    }

    #[tokio::test]
    async fn test_stale_checks_only_reports_old_in_progress_nodes() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        tracker.set_status("n1", NodeStatus::Queued, Some("s1"), Some("alice")).await.unwrap();

        assert!(tracker.stale_checks(Duration::from_secs(3600)).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let stale = tracker.stale_checks(Duration::from_millis(1)).await.unwrap();
        assert_eq!(
            stale,
            vec![StaleCheck {
                node_id: "n1".into(),
                status: NodeStatus::Queued,
                session_id: Some("s1".into()),
                username: Some("alice".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_live_updates_in_insertion_order() {
        let tracker = tracker(TransitionPolicy::Strict).await;
        tracker.append_live_update("s1", "n1", "connecting", "dialing", 10).await.unwrap();
        tracker.append_live_update("s2", "n2", "running", "other", 50).await.unwrap();
        tracker.append_live_update("s1", "n1", "completed", "done", 250).await.unwrap();

        let updates = tracker.live_updates("s1").await.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].message, "dialing");
        assert_eq!(updates[1].status, "completed");
        assert_eq!(updates[1].progress_percentage, 100);
        assert!(updates[0].id < updates[1].id);
    }
}
