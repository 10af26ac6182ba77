//! Node check state machine.
//!
//! # States
//! ```text
//! idle → queued → connecting → running → polling → completed | failed | timeout
//!                                                       ↓
//!                                                     idle (or queued directly)
//! ```
//!
//! Any in-progress state may end early in `failed` or `timeout`; `queued`
//! and `connecting` may fall back to `idle` when a check is deferred
//! (no credential, no proxy). Re-entering the current state is allowed.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a node's health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Idle,
    Queued,
    Connecting,
    Running,
    Polling,
    Completed,
    Failed,
    Timeout,
}

impl NodeStatus {
    /// States counted by admission control.
    pub const IN_PROGRESS: [NodeStatus; 4] = [
        NodeStatus::Queued,
        NodeStatus::Connecting,
        NodeStatus::Running,
        NodeStatus::Polling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Queued => "queued",
            NodeStatus::Connecting => "connecting",
            NodeStatus::Running => "running",
            NodeStatus::Polling => "polling",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Timeout => "timeout",
        }
    }

    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Timeout)
    }

    /// Whether `self → next` is in the transition table.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;

        if *self == next {
            return true;
        }
        match self {
            Idle => matches!(next, Queued),
            Queued => matches!(next, Connecting | Idle | Failed | Timeout),
            Connecting => matches!(next, Running | Idle | Failed | Timeout),
            Running => matches!(next, Polling | Completed | Failed | Timeout),
            Polling => matches!(next, Completed | Failed | Timeout),
            Completed | Failed | Timeout => matches!(next, Idle | Queued),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(NodeStatus::Idle),
            "queued" => Ok(NodeStatus::Queued),
            "connecting" => Ok(NodeStatus::Connecting),
            "running" => Ok(NodeStatus::Running),
            "polling" => Ok(NodeStatus::Polling),
            "completed" => Ok(NodeStatus::Completed),
            "failed" => Ok(NodeStatus::Failed),
            "timeout" => Ok(NodeStatus::Timeout),
            _ => Err(format!("Invalid node status: {}", s)),
        }
    }
}

impl rusqlite::types::FromSql for NodeStatus {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let raw = value.as_str()?;
        raw.parse()
            .map_err(|e: String| rusqlite::types::FromSqlError::Other(e.into()))
    }
}

impl rusqlite::types::ToSql for NodeStatus {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}
