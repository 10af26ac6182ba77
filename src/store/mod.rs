//! Persistent store subsystem.
//!
//! # Data Flow
//! ```text
//! pool / proxy / status / inventory
//!     → Database::call (closure over &mut Connection)
//!     → tokio blocking pool
//!     → SQLite (BEGIN IMMEDIATE for read-modify-write)
//!     → HcError classification (conflict / unavailable / not found)
//! ```
//!
//! # Design Decisions
//! - One shared connection per process; the SQLite write lock taken by
//!   `BEGIN IMMEDIATE` plays the role of row-level `FOR UPDATE` locking
//! - `busy_timeout` absorbs short lock waits from other processes
//! - Blocking calls never run on the async worker threads

pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{HcError, HcResult};

/// Shared handle to the coordinator database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> HcResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| HcError::Unavailable {
                    op: "open",
                    detail: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }
        let conn = Connection::open(path).map_err(|e| HcError::from_store("open", e))?;
        tracing::info!(path = %path.display(), "Opened coordinator database");
        Self::init(conn)
    }

    /// Open a private in-memory database (tests and dry runs).
    pub fn open_in_memory() -> HcResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| HcError::from_store("open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> HcResult<Self> {
        apply_pragmas(&conn).map_err(|e| HcError::from_store("pragmas", e))?;
        schema::create_tables(&conn).map_err(|e| HcError::from_store("create_tables", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a store closure on the blocking pool, classifying rusqlite errors.
    pub async fn call<F, T>(&self, op: &'static str, f: F) -> HcResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call_with(op, move |conn| f(conn).map_err(|e| HcError::from_store(op, e)))
            .await
    }

    /// Like [`Database::call`] but the closure produces crate errors itself.
    pub async fn call_with<F, T>(&self, op: &'static str, f: F) -> HcResult<T>
    where
        F: FnOnce(&mut Connection) -> HcResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_conn(&conn);
            f(&mut *guard)
        })
        .await
        .map_err(|e| HcError::Unavailable {
            op,
            detail: format!("store task failed: {}", e),
        })?
    }

    /// Run a store closure on the current thread (CLI and setup paths).
    pub fn call_blocking<F, T>(&self, op: &'static str, f: F) -> HcResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut guard = lock_conn(&self.conn);
        f(&mut *guard).map_err(|e| HcError::from_store(op, e))
    }
}

/// Lock the connection, recovering from a poisoned mutex.
fn lock_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Database mutex poisoned, recovering connection");
            conn.clear_poison();
            poisoned.into_inner()
        }
    }
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_millis(5_000))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Current time in the text format stored in every timestamp column.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let mut tables = db
            .call("list_tables", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .await
            .unwrap();
        tables.sort();
        assert_eq!(
            tables,
            vec![
                "credential_sessions",
                "credentials",
                "live_updates",
                "node_status",
                "nodes",
                "proxies"
            ]
        );
    }

    #[test]
    fn test_session_owns_at_most_one_credential_row() {
        let db = Database::open_in_memory().unwrap();
        let columns = db
            .call_blocking("ownership_columns", |conn| {
                let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('credential_sessions')")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .unwrap();
        assert_eq!(columns, vec!["session_id", "username", "acquired_at"]);

        let second = db.call_blocking("ownership_rows", |conn| {
            conn.execute_batch(
                "INSERT INTO credentials (username, secret, target_ip, target_port, max_sessions)
                 VALUES ('alice', 's', '10.0.0.1', 22, 2), ('bob', 's', '10.0.0.1', 22, 2);
                 INSERT INTO credential_sessions (session_id, username, acquired_at)
                 VALUES ('s1', 'alice', '2024-01-01T00:00:00.000000Z');",
            )?;
            conn.execute(
                "INSERT INTO credential_sessions (session_id, username, acquired_at)
                 VALUES ('s1', 'bob', '2024-01-01T00:00:00.000000Z')",
                [],
            )
        });
        assert!(second.is_err());
    }

    #[test]
    fn test_open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hc.db");
        Database::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = now_timestamp();
        std::thread::sleep(Duration::from_millis(2));
        let b = now_timestamp();
        assert!(a < b);
    }
}
