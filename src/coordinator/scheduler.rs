//! Admission control: start checks while below the concurrency cap.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SharedConfig;
use crate::coordinator::workflow::{CheckOutcome, CheckWorkflow};
use crate::error::HcResult;
use crate::inventory::InventorySelector;

pub struct CheckScheduler {
    workflow: Arc<CheckWorkflow>,
    inventory: Arc<dyn InventorySelector>,
    config: SharedConfig,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl CheckScheduler {
    pub fn new(
        workflow: Arc<CheckWorkflow>,
        inventory: Arc<dyn InventorySelector>,
        config: SharedConfig,
    ) -> Self {
        Self {
            workflow,
            inventory,
            config,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Checks spawned and not yet reaped.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Start as many due checks as the cap allows. Returns how many were started.
    pub async fn schedule_once(&mut self) -> HcResult<usize> {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Check task panicked");
            }
        }

        let cap = u64::from(self.config.load().checks.max_concurrent_checks);
        let active = self.workflow.tracker().active_check_count().await?;
        if active >= cap {
            tracing::debug!(active, cap, "Concurrency cap reached, not scheduling");
            return Ok(0);
        }

        let nodes = self
            .inventory
            .nodes_due_for_check((cap - active) as usize)
            .await?;
        let mut started = 0;
        for node in nodes {
            let session_id = Uuid::new_v4().to_string();
            // Queued before spawning so the next pass neither counts it
            // as free capacity nor offers it again.
            if let Err(e) = self.workflow.enqueue(&node, &session_id).await {
                tracing::warn!(node_id = %node.id, error = %e, "Could not queue node");
                continue;
            }

            let workflow = self.workflow.clone();
            let cancel = self.cancel.child_token();
            self.tasks.spawn(async move {
                let node_id = node.id.clone();
                match workflow.execute(node, session_id.clone(), cancel).await {
                    Ok(CheckOutcome::Deferred(reason)) => {
                        tracing::debug!(node_id = %node_id, session_id = %session_id, reason = %reason, "Check deferred");
                    }
                    Ok(outcome) => {
                        tracing::debug!(node_id = %node_id, session_id = %session_id, outcome = ?outcome, "Check task finished");
                    }
                    Err(e) => {
                        tracing::error!(node_id = %node_id, session_id = %session_id, error = %e, "Check task failed");
                    }
                }
            });
            started += 1;
        }

        if started > 0 {
            tracing::info!(started, active, cap, "Scheduled checks");
        }
        Ok(started)
    }

    /// Schedule on an interval until shutdown, then cancel and drain running checks.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let interval = self.config.load().checks.schedule_interval();
        tracing::info!(interval_secs = interval.as_secs(), "Check scheduler starting");

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.schedule_once().await {
                        tracing::error!(error = %e, "Scheduling pass failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Check scheduler received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        self.drain().await;
    }

    /// Cancel running checks and wait for them to record and release.
    pub async fn drain(&mut self) {
        self.cancel.cancel();
        let pending = self.tasks.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for running checks to finish");
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Check task panicked");
            }
        }
    }
}
