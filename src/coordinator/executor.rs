//! The seam between bookkeeping and the actual check protocol.
//!
//! The coordinator never talks to nodes itself. A [`CheckExecutor`]
//! connects to a node through a proxy using a pooled credential and runs
//! the check; the coordinator handles everything around it.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::HcResult;
use crate::inventory::Node;
use crate::pool::Credential;
use crate::proxy::Proxy;
use crate::status::{NodeStatus, NodeStatusTracker};

/// Why a check did not succeed.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The proxy could not carry the connection; the next proxy is tried.
    #[error("proxy unusable: {0}")]
    Proxy(String),

    /// The node refused, misbehaved, or reported unhealthy.
    #[error("{0}")]
    Node(String),

    /// The protocol gave up waiting on the node.
    #[error("check timed out: {0}")]
    TimedOut(String),
}

/// What a check is about: one node, checked by one session with one credential.
#[derive(Debug, Clone)]
pub struct CheckTarget {
    pub session_id: String,
    pub node: Node,
    pub credential: Credential,
}

/// Everything a running check may use.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub target: CheckTarget,
    pub proxy: Proxy,
    pub progress: ProgressReporter,
}

/// Lets an executor publish progress for its session.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tracker: NodeStatusTracker,
    session_id: String,
    node_id: String,
    username: String,
}

impl ProgressReporter {
    pub(crate) fn new(tracker: NodeStatusTracker, target: &CheckTarget) -> Self {
        Self {
            tracker,
            session_id: target.session_id.clone(),
            node_id: target.node.id.clone(),
            username: target.credential.username.clone(),
        }
    }

    /// Append a live update for this session.
    pub async fn report(&self, status: &str, message: &str, percent: u8) -> HcResult<()> {
        self.tracker
            .append_live_update(&self.session_id, &self.node_id, status, message, percent)
            .await
    }

    /// Move the node from `running` to `polling` while waiting on results.
    pub async fn polling(&self) -> HcResult<()> {
        self.tracker
            .set_status(
                &self.node_id,
                NodeStatus::Polling,
                Some(&self.session_id),
                Some(&self.username),
            )
            .await
    }
}

#[async_trait]
pub trait CheckExecutor: Send + Sync {
    /// Open a connection to the node through `proxy`.
    ///
    /// Returning [`CheckError::Proxy`] fails over to the next proxy; any
    /// other error ends the check.
    async fn connect(&self, target: &CheckTarget, proxy: &Proxy) -> Result<(), CheckError>;

    /// Run the check over the connection opened by `connect`.
    async fn run(&self, ctx: &CheckContext) -> Result<(), CheckError>;
}
