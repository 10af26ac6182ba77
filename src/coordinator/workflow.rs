//! One node's check, from queueing to credential release.

use std::sync::Arc;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::SharedConfig;
use crate::coordinator::executor::{
    CheckContext, CheckError, CheckExecutor, CheckTarget, ProgressReporter,
};
use crate::error::{HcError, HcResult};
use crate::inventory::Node;
use crate::pool::CredentialPool;
use crate::proxy::ProxySelector;
use crate::status::{NodeStatus, NodeStatusTracker};

/// How a check workflow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Completed,
    Failed(String),
    TimedOut(String),
    /// Nothing was checked; the node is idle again.
    Deferred(String),
}

/// Result of the connect and run phase, before it is recorded.
enum Attempted {
    NoProxy,
    Finished(Result<(), CheckError>),
}

/// Drives a single node through the status machine around an executor.
pub struct CheckWorkflow {
    pool: Arc<CredentialPool>,
    proxies: ProxySelector,
    tracker: NodeStatusTracker,
    executor: Arc<dyn CheckExecutor>,
    config: SharedConfig,
}

impl CheckWorkflow {
    pub fn new(
        pool: Arc<CredentialPool>,
        proxies: ProxySelector,
        tracker: NodeStatusTracker,
        executor: Arc<dyn CheckExecutor>,
        config: SharedConfig,
    ) -> Self {
        Self {
            pool,
            proxies,
            tracker,
            executor,
            config,
        }
    }

    pub fn tracker(&self) -> &NodeStatusTracker {
        &self.tracker
    }

    /// Queue and execute a check for `node`.
    pub async fn run(
        &self,
        node: Node,
        session_id: String,
        cancel: CancellationToken,
    ) -> HcResult<CheckOutcome> {
        self.enqueue(&node, &session_id).await?;
        self.execute(node, session_id, cancel).await
    }

    /// Mark `node` queued for `session_id` so it counts against admission
    /// and is no longer offered by the inventory.
    pub async fn enqueue(&self, node: &Node, session_id: &str) -> HcResult<()> {
        self.tracker.ensure_node(&node.id).await?;
        self.tracker
            .set_status(&node.id, NodeStatus::Queued, Some(session_id), None)
            .await
    }

    /// Execute a check for a node already queued by [`CheckWorkflow::enqueue`].
    ///
    /// The credential is released on every path once acquired.
    pub async fn execute(
        &self,
        node: Node,
        session_id: String,
        cancel: CancellationToken,
    ) -> HcResult<CheckOutcome> {
        let credential = match self.pool.acquire_with_cancel(&session_id, &cancel, None).await {
            Ok(credential) => credential,
            Err(e) => {
                self.return_to_idle(&node.id, &session_id).await;
                if e.is_deferrable() {
                    tracing::warn!(node_id = %node.id, session_id = %session_id, error = %e, "Check deferred, no credential");
                    return Ok(CheckOutcome::Deferred(e.to_string()));
                }
                return Err(e);
            }
        };

        let username = credential.username.clone();
        let target = CheckTarget {
            session_id,
            node,
            credential,
        };
        let outcome = self.drive(&target, &cancel).await;

        if let Err(e) = self.pool.release(&username, &target.session_id).await {
            tracing::error!(
                node_id = %target.node.id,
                session_id = %target.session_id,
                username = %username,
                error = %e,
                "Failed to release credential"
            );
        }
        outcome
    }

    async fn drive(&self, target: &CheckTarget, cancel: &CancellationToken) -> HcResult<CheckOutcome> {
        let node_id = target.node.id.as_str();
        let session_id = target.session_id.as_str();
        let username = target.credential.username.as_str();

        self.tracker
            .set_status(node_id, NodeStatus::Connecting, Some(session_id), Some(username))
            .await?;
        self.note(target, "connecting", "Connecting through proxy", 10).await;

        let check_timeout = self.config.load().checks.check_timeout();
        let started = Instant::now();
        let attempted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(Attempted::Finished(Err(CheckError::Node("check cancelled".to_string())))),
            res = time::timeout(check_timeout, self.connect_and_run(target)) => match res {
                Ok(inner) => inner,
                Err(_) => Ok(Attempted::Finished(Err(CheckError::TimedOut(format!(
                    "no result within {} s",
                    check_timeout.as_secs()
                ))))),
            },
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let attempted = match attempted {
            Ok(attempted) => attempted,
            Err(e) => {
                let message = e.to_string();
                self.finish(target, false, duration_ms, Some(&message)).await;
                return Err(e);
            }
        };

        let outcome = match attempted {
            Attempted::NoProxy => {
                tracing::warn!(node_id, session_id, "Check deferred, no active proxy");
                self.return_to_idle(node_id, session_id).await;
                return Ok(CheckOutcome::Deferred("no active proxy".to_string()));
            }
            Attempted::Finished(Ok(())) => {
                self.finish(target, true, duration_ms, None).await;
                CheckOutcome::Completed
            }
            Attempted::Finished(Err(CheckError::TimedOut(message))) => {
                if let Err(e) = self
                    .tracker
                    .record_timeout(node_id, session_id, duration_ms, Some(&message))
                    .await
                {
                    tracing::error!(node_id, session_id, error = %e, "Failed to record check timeout");
                }
                CheckOutcome::TimedOut(message)
            }
            Attempted::Finished(Err(err)) => {
                let message = err.to_string();
                self.finish(target, false, duration_ms, Some(&message)).await;
                CheckOutcome::Failed(message)
            }
        };

        self.note(target, "finished", outcome_label(&outcome), 100).await;
        Ok(outcome)
    }

    async fn connect_and_run(&self, target: &CheckTarget) -> HcResult<Attempted> {
        let executor = &*self.executor;

        // Only proxy errors fail over; a node answering badly still proves the proxy.
        let connected = self
            .proxies
            .with_failover(move |proxy| async move {
                match executor.connect(target, &proxy).await {
                    Err(CheckError::Proxy(reason)) => Err(CheckError::Proxy(reason)),
                    other => Ok(other),
                }
            })
            .await;

        let (proxy, connect_result) = match connected {
            Err(HcError::NotFound(_)) => return Ok(Attempted::NoProxy),
            Err(e) => return Err(e),
            Ok(Err(all_failed)) => return Ok(Attempted::Finished(Err(all_failed))),
            Ok(Ok(pair)) => pair,
        };
        if let Err(e) = connect_result {
            return Ok(Attempted::Finished(Err(e)));
        }

        let node_id = target.node.id.as_str();
        let session_id = target.session_id.as_str();
        self.tracker
            .set_status(
                node_id,
                NodeStatus::Running,
                Some(session_id),
                Some(&target.credential.username),
            )
            .await?;
        tracing::info!(node_id, session_id, proxy = %proxy.name, "Check running");
        self.note(target, "running", &format!("Connected via {}", proxy.name), 30).await;

        let ctx = CheckContext {
            target: target.clone(),
            proxy,
            progress: ProgressReporter::new(self.tracker.clone(), target),
        };
        Ok(Attempted::Finished(self.executor.run(&ctx).await))
    }

    async fn finish(&self, target: &CheckTarget, success: bool, duration_ms: u64, error: Option<&str>) {
        if let Err(e) = self
            .tracker
            .record_completion(&target.node.id, &target.session_id, success, duration_ms, error)
            .await
        {
            tracing::error!(
                node_id = %target.node.id,
                session_id = %target.session_id,
                error = %e,
                "Failed to record check completion"
            );
        }
    }

    async fn return_to_idle(&self, node_id: &str, session_id: &str) {
        if let Err(e) = self.tracker.mark_idle(node_id).await {
            tracing::error!(node_id, session_id, error = %e, "Failed to return node to idle");
        }
    }

    async fn note(&self, target: &CheckTarget, status: &str, message: &str, percent: u8) {
        if let Err(e) = self
            .tracker
            .append_live_update(&target.session_id, &target.node.id, status, message, percent)
            .await
        {
            tracing::debug!(node_id = %target.node.id, error = %e, "Live update dropped");
        }
    }
}

fn outcome_label(outcome: &CheckOutcome) -> &str {
    match outcome {
        CheckOutcome::Completed => "completed",
        CheckOutcome::Failed(message) | CheckOutcome::TimedOut(message) | CheckOutcome::Deferred(message) => {
            message
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::{shared, CoordinatorConfig, TransitionPolicy};
    use crate::pool::NewCredential;
    use crate::proxy::{NewProxy, Proxy};
    use crate::store::Database;

    #[derive(Default)]
    struct ScriptedExecutor {
        broken_proxies: Vec<&'static str>,
        node_error: Option<&'static str>,
        hang: bool,
        poll: bool,
        connects: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CheckExecutor for ScriptedExecutor {
        async fn connect(&self, _target: &CheckTarget, proxy: &Proxy) -> Result<(), CheckError> {
            self.connects.lock().unwrap().push(proxy.name.clone());
            if self.broken_proxies.contains(&proxy.name.as_str()) {
                return Err(CheckError::Proxy(format!("{} refused tunnel", proxy.name)));
            }
            Ok(())
        }

        async fn run(&self, ctx: &CheckContext) -> Result<(), CheckError> {
            if self.poll {
                ctx.progress.polling().await.unwrap();
                ctx.progress.report("polling", "waiting for counters", 60).await.unwrap();
            }
            if self.hang {
                time::sleep(Duration::from_secs(30)).await;
            }
            match self.node_error {
                Some(message) => Err(CheckError::Node(message.to_string())),
                None => Ok(()),
            }
        }
    }

    struct Harness {
        workflow: CheckWorkflow,
        pool: Arc<CredentialPool>,
        proxies: ProxySelector,
        tracker: NodeStatusTracker,
    }

    async fn harness(executor: ScriptedExecutor) -> Harness {
        let mut config = CoordinatorConfig::default();
        config.pool.poll_interval_ms = 20;
        config.pool.max_wait_ms = 200;
        config.checks.check_timeout_secs = 1;
        config.status.transition_policy = TransitionPolicy::Strict;
        let config = shared(config);

        let db = Database::open_in_memory().unwrap();
        let pool = Arc::new(CredentialPool::new(db.clone(), config.clone()));
        pool.upsert_credential(NewCredential {
            username: "alice".into(),
            secret: "pw".into(),
            target_ip: "10.0.0.1".into(),
            target_port: 22,
            max_sessions: 1,
            enabled: true,
        })
        .await
        .unwrap();

        let proxies = ProxySelector::new(db.clone());
        for (name, priority) in [("p1", 1), ("p2", 2)] {
            proxies
                .upsert_proxy(NewProxy {
                    name: name.into(),
                    ip: "192.168.0.1".into(),
                    port: 3128,
                    user: String::new(),
                    priority,
                    is_primary: priority == 1,
                    is_active: true,
                })
                .await
                .unwrap();
        }

        let tracker = NodeStatusTracker::new(db, config.clone());
        let workflow = CheckWorkflow::new(
            pool.clone(),
            proxies.clone(),
            tracker.clone(),
            Arc::new(executor),
            config,
        );
        Harness {
            workflow,
            pool,
            proxies,
            tracker,
        }
    }

    fn node() -> Node {
        Node {
            id: "n1".into(),
            address: "10.9.0.1".into(),
            hostname: "edge-1".into(),
            site: "dc1".into(),
            group: "north".into(),
            vendor: "unknown".into(),
            node_type: "router".into(),
        }
    }

    async fn run(h: &Harness, session: &str) -> CheckOutcome {
        h.workflow
            .run(node(), session.to_string(), CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_check_records_and_releases() {
        let h = harness(ScriptedExecutor {
            poll: true,
            ..Default::default()
        })
        .await;

        assert_eq!(run(&h, "s1").await, CheckOutcome::Completed);

        let record = h.tracker.node_record("n1").await.unwrap();
        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.successful_checks, 1);
        assert_eq!(record.current_session_id, None);

        let credential = h.pool.get_credential("alice").await.unwrap();
        assert_eq!(credential.current_sessions, 0);
        assert!(credential.active_session_ids.is_empty());
        assert!(h.pool.ledger().is_empty());

        assert_eq!(h.proxies.get_proxy("p1").await.unwrap().total_attempts, 1);

        let updates = h.tracker.live_updates("s1").await.unwrap();
        let stages: Vec<_> = updates.iter().map(|u| u.status.as_str()).collect();
        assert_eq!(stages, vec!["connecting", "running", "polling", "finished"]);
        assert_eq!(updates.last().unwrap().progress_percentage, 100);
    }

    #[tokio::test]
    async fn test_broken_proxy_fails_over() {
        let h = harness(ScriptedExecutor {
            broken_proxies: vec!["p1"],
            ..Default::default()
        })
        .await;

        assert_eq!(run(&h, "s1").await, CheckOutcome::Completed);

        let p1 = h.proxies.get_proxy("p1").await.unwrap();
        let p2 = h.proxies.get_proxy("p2").await.unwrap();
        assert_eq!((p1.total_attempts, p1.failed_attempts), (1, 1));
        assert_eq!((p2.total_attempts, p2.failed_attempts), (1, 0));
    }

    #[tokio::test]
    async fn test_node_failure_is_recorded() {
        let h = harness(ScriptedExecutor {
            node_error: Some("conn refused"),
            ..Default::default()
        })
        .await;

        assert_eq!(run(&h, "s1").await, CheckOutcome::Failed("conn refused".into()));

        let record = h.tracker.node_record("n1").await.unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("conn refused"));
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(h.pool.get_credential("alice").await.unwrap().current_sessions, 0);
    }

    #[tokio::test]
    async fn test_no_credential_defers_check() {
        let h = harness(ScriptedExecutor::default()).await;
        h.pool.set_expired("alice", true).await.unwrap();

        assert!(matches!(run(&h, "s1").await, CheckOutcome::Deferred(_)));

        let record = h.tracker.node_record("n1").await.unwrap();
        assert_eq!(record.status, NodeStatus::Idle);
        assert_eq!(record.total_checks, 0);
    }

    #[tokio::test]
    async fn test_no_proxy_defers_and_releases() {
        let executor = ScriptedExecutor::default();
        let h = harness(executor).await;
        h.proxies.set_active("p1", false).await.unwrap();
        h.proxies.set_active("p2", false).await.unwrap();

        assert_eq!(
            run(&h, "s1").await,
            CheckOutcome::Deferred("no active proxy".into())
        );
        assert_eq!(h.tracker.get_status("n1").await.unwrap(), NodeStatus::Idle);
        assert_eq!(h.pool.get_credential("alice").await.unwrap().current_sessions, 0);
    }

    #[tokio::test]
    async fn test_hung_check_times_out() {
        let h = harness(ScriptedExecutor {
            hang: true,
            ..Default::default()
        })
        .await;

        assert!(matches!(run(&h, "s1").await, CheckOutcome::TimedOut(_)));

        let record = h.tracker.node_record("n1").await.unwrap();
        assert_eq!(record.status, NodeStatus::Timeout);
        assert_eq!(record.last_check_result.as_deref(), Some("timeout"));
        assert_eq!(h.pool.get_credential("alice").await.unwrap().current_sessions, 0);
    }

    #[tokio::test]
    async fn test_cancelled_check_is_failed_and_released() {
        let h = harness(ScriptedExecutor {
            hang: true,
            ..Default::default()
        })
        .await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = h.workflow.run(node(), "s1".into(), cancel).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Failed("check cancelled".into()));
        assert_eq!(h.pool.get_credential("alice").await.unwrap().current_sessions, 0);
    }
}
