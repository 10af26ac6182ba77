//! Progress feed for dashboards.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::pool::credential::parse_timestamp;

/// One progress entry emitted during a check session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveUpdate {
    pub id: i64,
    pub session_id: String,
    pub node_id: String,
    pub status: String,
    pub message: String,
    pub progress_percentage: u8,
    pub created_at: Option<DateTime<Utc>>,
}

fn update_from_row(row: &Row<'_>) -> rusqlite::Result<LiveUpdate> {
    Ok(LiveUpdate {
        id: row.get(0)?,
        session_id: row.get(1)?,
        node_id: row.get(2)?,
        status: row.get(3)?,
        message: row.get(4)?,
        progress_percentage: row.get(5)?,
        created_at: parse_timestamp(row.get(6)?),
    })
}

pub(crate) fn insert_update(
    conn: &Connection,
    session_id: &str,
    node_id: &str,
    status: &str,
    message: &str,
    progress: u8,
    now: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO live_updates (session_id, node_id, status, message, progress_percentage, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![session_id, node_id, status, message, progress.min(100), now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn updates_for_session(conn: &Connection, session_id: &str) -> rusqlite::Result<Vec<LiveUpdate>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, node_id, status, message, progress_percentage, created_at
         FROM live_updates WHERE session_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![session_id], update_from_row)?;
    let updates = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(updates)
}
