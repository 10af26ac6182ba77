//! Node inventory: which nodes exist and which are due for a check.
//!
//! The coordinator consumes inventory through [`InventorySelector`] as a
//! ranked, read-only source. [`SqliteInventory`] is the built-in source
//! over the `nodes` table.

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HcResult;

pub use sqlite::{NewNode, SqliteInventory};

/// A node descriptor as handed to check workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default = "default_node_type")]
    pub node_type: String,
}

pub(crate) fn default_vendor() -> String {
    "unknown".to_string()
}

pub(crate) fn default_node_type() -> String {
    "router".to_string()
}

/// Ranked source of nodes due for checking.
#[async_trait]
pub trait InventorySelector: Send + Sync {
    /// Up to `limit` nodes, most overdue first. An empty result is not an error.
    async fn nodes_due_for_check(&self, limit: usize) -> HcResult<Vec<Node>>;
}
