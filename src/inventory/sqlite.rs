//! Inventory backed by the coordinator database.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::{HcError, HcResult};
use crate::inventory::{default_node_type, default_vendor, InventorySelector, Node};
use crate::store::{now_timestamp, Database};

const NODE_COLUMNS: &str = "n.node_id, n.address, n.hostname, n.site, n.node_group,
    COALESCE(n.vendor, 'unknown'), COALESCE(n.node_type, 'router')";

// Enabled, not in flight, and either never checked or finished.
const ELIGIBLE: &str = "n.login_enabled = 1
    AND n.health_check_enabled = 1
    AND COALESCE(s.current_status, 'idle') IN ('idle', 'completed', 'failed', 'timeout')
    AND s.current_session_id IS NULL";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        address: row.get(1)?,
        hostname: row.get(2)?,
        site: row.get(3)?,
        group: row.get(4)?,
        vendor: row.get(5)?,
        node_type: row.get(6)?,
    })
}

/// Administrative definition of a node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewNode {
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
    /// Higher values are checked first among equally overdue nodes.
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "enabled")]
    pub health_check_enabled: bool,
    #[serde(default = "enabled")]
    pub login_enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct SqliteInventory {
    db: Database,
}

impl SqliteInventory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a node, creating its idle status row if missing.
    pub async fn upsert_node(&self, node: NewNode) -> HcResult<()> {
        self.db
            .call("upsert_node", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT INTO nodes
                        (node_id, address, hostname, site, node_group, vendor, node_type,
                         priority, health_check_enabled, login_enabled)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(node_id) DO UPDATE SET
                        address = excluded.address,
                        hostname = excluded.hostname,
                        site = excluded.site,
                        node_group = excluded.node_group,
                        vendor = excluded.vendor,
                        node_type = excluded.node_type,
                        priority = excluded.priority,
                        health_check_enabled = excluded.health_check_enabled,
                        login_enabled = excluded.login_enabled",
                    params![
                        node.id,
                        node.address,
                        node.hostname,
                        node.site,
                        node.group,
                        node.vendor,
                        node.node_type,
                        node.priority,
                        node.health_check_enabled,
                        node.login_enabled,
                    ],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO node_status (node_id, current_status, updated_at)
                     VALUES (?1, 'idle', ?2)",
                    params![node.id, now_timestamp()],
                )?;
                tx.commit()
            })
            .await
    }

    /// A login-enabled node by id.
    pub async fn node_by_id(&self, node_id: &str) -> HcResult<Node> {
        let id = node_id.to_string();
        self.db
            .call("node_by_id", move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM nodes n WHERE n.node_id = ?1 AND n.login_enabled = 1",
                        NODE_COLUMNS
                    ),
                    params![id],
                    node_from_row,
                )
                .optional()
            })
            .await?
            .ok_or_else(|| HcError::NotFound(format!("node {}", node_id)))
    }

    /// Eligible nodes in one group.
    pub async fn nodes_by_group(&self, group: &str, limit: usize) -> HcResult<Vec<Node>> {
        let group = group.to_string();
        let limit = limit as i64;
        self.db
            .call("nodes_by_group", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM nodes n
                     LEFT JOIN node_status s ON s.node_id = n.node_id
                     WHERE n.node_group = ?1 AND {}
                     ORDER BY n.node_id
                     LIMIT ?2",
                    NODE_COLUMNS, ELIGIBLE
                ))?;
                let rows = stmt.query_map(params![group, limit], node_from_row)?;
                let nodes = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(nodes)
            })
            .await
    }
}

#[async_trait]
impl InventorySelector for SqliteInventory {
    async fn nodes_due_for_check(&self, limit: usize) -> HcResult<Vec<Node>> {
        let limit = limit as i64;
        self.db
            .call("nodes_due_for_check", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM nodes n
                     LEFT JOIN node_status s ON s.node_id = n.node_id
                     WHERE {}
                     ORDER BY COALESCE(s.last_check_completed, '') ASC, n.priority DESC, n.node_id ASC
                     LIMIT ?1",
                    NODE_COLUMNS, ELIGIBLE
                ))?;
                let rows = stmt.query_map(params![limit], node_from_row)?;
                let nodes = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(nodes)
            })
            .await
    }
}
