//! Credential records and pool summaries.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// `login_status` value for a credential that may be handed out.
pub const LOGIN_ENABLED: &str = "Yes";

/// Login materials time-shared across check sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub username: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub target_ip: String,
    pub target_port: u16,
    pub current_sessions: u32,
    pub max_sessions: u32,
    /// Sessions currently holding this credential.
    pub active_session_ids: BTreeSet<String>,
    pub enabled: bool,
    pub is_expired: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_usage_count: u64,
}

impl Credential {
    /// Free session slots at the time this record was read.
    pub fn free_slots(&self) -> u32 {
        self.max_sessions.saturating_sub(self.current_sessions)
    }
}

/// Administrative definition of a credential.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewCredential {
    pub username: String,
    pub secret: String,
    pub target_ip: String,
    pub target_port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_sessions() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Aggregate capacity of the credential pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total_users: u64,
    pub active_users: u64,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub available_capacity: u64,
}

pub(crate) fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read one credential with its owning sessions.
pub(crate) fn load_credential(conn: &Connection, username: &str) -> rusqlite::Result<Option<Credential>> {
    let credential = conn
        .query_row(
            "SELECT username, secret, target_ip, target_port, current_sessions, max_sessions,
                    login_status, is_expired, last_used_at, total_usage_count
             FROM credentials WHERE username = ?1",
            params![username],
            |row| {
                let login_status: String = row.get(6)?;
                Ok(Credential {
                    username: row.get(0)?,
                    secret: row.get(1)?,
                    target_ip: row.get(2)?,
                    target_port: row.get(3)?,
                    current_sessions: row.get(4)?,
                    max_sessions: row.get(5)?,
                    active_session_ids: BTreeSet::new(),
                    enabled: login_status == LOGIN_ENABLED,
                    is_expired: row.get(7)?,
                    last_used_at: parse_timestamp(row.get(8)?),
                    total_usage_count: row.get(9)?,
                })
            },
        )
        .optional()?;

    let Some(mut credential) = credential else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT session_id FROM credential_sessions WHERE username = ?1")?;
    let sessions = stmt.query_map(params![username], |row| row.get::<_, String>(0))?;
    for session in sessions {
        credential.active_session_ids.insert(session?);
    }
    Ok(Some(credential))
}

pub(crate) fn read_pool_status(conn: &Connection) -> rusqlite::Result<PoolStatus> {
    conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN login_status = ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(max_sessions), 0),
                COALESCE(SUM(current_sessions), 0)
         FROM credentials",
        params![LOGIN_ENABLED],
        |row| {
            let total_capacity: u64 = row.get(2)?;
            let used_capacity: u64 = row.get(3)?;
            Ok(PoolStatus {
                total_users: row.get(0)?,
                active_users: row.get(1)?,
                total_capacity,
                used_capacity,
                available_capacity: total_capacity.saturating_sub(used_capacity),
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_accepts_stored_format() {
        let stamp = crate::store::now_timestamp();
        assert!(parse_timestamp(Some(stamp)).is_some());
        assert!(parse_timestamp(Some("yesterday".into())).is_none());
        assert!(parse_timestamp(None).is_none());
    }

    #[test]
    fn test_free_slots_saturates() {
        let credential = Credential {
            username: "u".into(),
            secret: "s".into(),
            target_ip: "10.0.0.1".into(),
            target_port: 22,
            current_sessions: 3,
            max_sessions: 2,
            active_session_ids: BTreeSet::new(),
            enabled: true,
            is_expired: false,
            last_used_at: None,
            total_usage_count: 0,
        };
        assert_eq!(credential.free_slots(), 0);
    }
}
