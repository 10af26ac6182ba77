//! Table definitions.

use rusqlite::Connection;

/// Create every table the coordinator uses. Idempotent.
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credentials (
            username TEXT PRIMARY KEY,
            secret TEXT NOT NULL,
            target_ip TEXT NOT NULL,
            target_port INTEGER NOT NULL,
            current_sessions INTEGER NOT NULL DEFAULT 0 CHECK (current_sessions >= 0),
            max_sessions INTEGER NOT NULL DEFAULT 1 CHECK (max_sessions >= 0),
            login_status TEXT NOT NULL DEFAULT 'Yes',
            is_expired INTEGER NOT NULL DEFAULT 0,
            last_used_at TEXT,
            total_usage_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS credential_sessions (
            session_id TEXT PRIMARY KEY,
            username TEXT NOT NULL REFERENCES credentials(username),
            acquired_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_credential_sessions_username
            ON credential_sessions(username);

        CREATE TABLE IF NOT EXISTS proxies (
            name TEXT PRIMARY KEY,
            ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            proxy_user TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 100,
            is_primary INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            total_attempts INTEGER NOT NULL DEFAULT 0,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            success_rate REAL NOT NULL DEFAULT 1.0,
            last_success TEXT,
            last_failure TEXT
        );

        CREATE TABLE IF NOT EXISTS nodes (
            node_id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            hostname TEXT NOT NULL DEFAULT '',
            site TEXT NOT NULL DEFAULT '',
            node_group TEXT NOT NULL DEFAULT '',
            vendor TEXT,
            node_type TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            health_check_enabled INTEGER NOT NULL DEFAULT 1,
            login_enabled INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS node_status (
            node_id TEXT PRIMARY KEY,
            current_status TEXT NOT NULL DEFAULT 'idle' CHECK (current_status IN
                ('idle', 'queued', 'connecting', 'running', 'polling', 'completed', 'failed', 'timeout')),
            current_session_id TEXT,
            current_username TEXT,
            last_check_started TEXT,
            last_check_completed TEXT,
            last_check_duration INTEGER,
            last_check_result TEXT,
            total_checks INTEGER NOT NULL DEFAULT 0,
            successful_checks INTEGER NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_successful_check TEXT,
            error_message TEXT,
            updated_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_node_status_current ON node_status(current_status);

        CREATE TABLE IF NOT EXISTS live_updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            status TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            progress_percentage INTEGER NOT NULL DEFAULT 0
                CHECK (progress_percentage BETWEEN 0 AND 100),
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_live_updates_session ON live_updates(session_id);",
    )
}
