//! Credential acquisition and release.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{shared, PoolConfig, SharedConfig};
use crate::error::{HcError, HcResult};
use crate::observability::metrics;
use crate::pool::credential::{
    load_credential, read_pool_status, Credential, NewCredential, PoolStatus, LOGIN_ENABLED,
};
use crate::pool::ledger::SessionLedger;
use crate::resilience::retries::{retry_on_conflict, RetryPolicy};
use crate::store::{now_timestamp, Database};

/// Outcome of one single-shot acquisition transaction.
enum Attempt {
    Acquired(Credential),
    NoneAvailable,
    AlreadyHeld(String),
}

/// Hands out credentials to check sessions without exceeding any
/// credential's session cap.
pub struct CredentialPool {
    db: Database,
    config: SharedConfig,
    /// FIFO-fair; serializes this process's attempts when enabled.
    attempt_lock: Mutex<()>,
    ledger: Arc<SessionLedger>,
}

impl CredentialPool {
    /// Create a pool reading its timings from a live config.
    pub fn new(db: Database, config: SharedConfig) -> Self {
        Self {
            db,
            config,
            attempt_lock: Mutex::new(()),
            ledger: Arc::new(SessionLedger::new()),
        }
    }

    /// Create a pool with fixed timings.
    pub fn with_pool_config(db: Database, pool: PoolConfig) -> Self {
        let mut config = crate::config::CoordinatorConfig::default();
        config.pool = pool;
        Self::new(db, shared(config))
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    /// Acquire a credential for `session_id`, waiting up to the configured
    /// maximum.
    pub async fn acquire(&self, session_id: &str) -> HcResult<Credential> {
        self.acquire_with_cancel(session_id, &CancellationToken::new(), None)
            .await
    }

    /// Acquire with external cancellation and an optional caller deadline.
    ///
    /// The effective deadline is the earlier of `deadline` and the pool's
    /// `max_wait`. Cancellation is observed between attempts without waiting
    /// for the next poll tick.
    pub async fn acquire_with_cancel(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> HcResult<Credential> {
        if let Some(held) = self.ledger.holder(session_id) {
            return Err(HcError::InvalidState(format!(
                "session {} already holds credential {}",
                session_id, held
            )));
        }

        let pool = self.config.load().pool.clone();
        let started = Instant::now();
        let pool_deadline = started + pool.max_wait();
        let deadline = deadline.map_or(pool_deadline, |d| d.min(pool_deadline));

        let mut ticker = time::interval(pool.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(session_id, attempts, "Credential acquisition cancelled");
                    return Err(HcError::Cancelled(format!("credential acquisition for {}", session_id)));
                }
                _ = time::sleep_until(deadline) => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    metrics::record_acquire_timeout();
                    tracing::warn!(session_id, attempts, waited_ms, "Timed out waiting for a credential");
                    return Err(HcError::Timeout {
                        what: "available credential".to_string(),
                        waited_ms,
                    });
                }
                _ = ticker.tick() => {
                    attempts += 1;
                    if let Some(credential) = self.try_acquire(session_id, &pool).await? {
                        let waited = started.elapsed();
                        metrics::record_credential_acquired(waited);
                        tracing::info!(
                            session_id,
                            username = %credential.username,
                            current_sessions = credential.current_sessions,
                            max_sessions = credential.max_sessions,
                            attempts,
                            waited_ms = waited.as_millis() as u64,
                            "Credential acquired"
                        );
                        return Ok(credential);
                    }
                    tracing::debug!(session_id, attempts, "No credential available, waiting");
                }
            }
        }
    }

    /// One acquisition transaction. `Ok(None)` means nothing was eligible.
    pub async fn try_acquire(
        &self,
        session_id: &str,
        pool: &PoolConfig,
    ) -> HcResult<Option<Credential>> {
        let _serial = if pool.serialize_attempts {
            Some(self.attempt_lock.lock().await)
        } else {
            None
        };

        let policy = RetryPolicy::from(pool);
        let attempt = retry_on_conflict("acquire", policy, || {
            let session_id = session_id.to_string();
            self.db
                .call("acquire", move |conn| acquire_in_tx(conn, &session_id))
        })
        .await?;

        match attempt {
            Attempt::Acquired(credential) => {
                self.ledger.record(session_id, &credential.username);
                Ok(Some(credential))
            }
            Attempt::NoneAvailable => Ok(None),
            Attempt::AlreadyHeld(username) => Err(HcError::InvalidState(format!(
                "session {} already holds credential {}",
                session_id, username
            ))),
        }
    }

    /// Return `session_id`'s hold on `username` to the pool.
    ///
    /// Releasing a session that does not hold the credential is a no-op;
    /// the return value says whether anything was released.
    pub async fn release(&self, username: &str, session_id: &str) -> HcResult<bool> {
        let pool = self.config.load().pool.clone();
        let policy = RetryPolicy::from(&pool);
        let released = retry_on_conflict("release", policy, || {
            let username = username.to_string();
            let session_id = session_id.to_string();
            self.db
                .call("release", move |conn| release_in_tx(conn, &username, &session_id))
        })
        .await?;

        self.ledger.forget(session_id, username);
        if released {
            metrics::record_credential_released();
            tracing::info!(session_id, username, "Credential released");
        } else {
            tracing::debug!(session_id, username, "Release was a no-op, session not holding credential");
        }
        Ok(released)
    }

    /// Release whatever credential `session_id` holds. Returns its username.
    pub async fn release_session(&self, session_id: &str) -> HcResult<Option<String>> {
        let sid = session_id.to_string();
        let holder = self
            .db
            .call("release_session", move |conn| {
                conn.query_row(
                    "SELECT username FROM credential_sessions WHERE session_id = ?1",
                    params![sid],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;

        match holder {
            Some(username) => {
                self.release(&username, session_id).await?;
                Ok(Some(username))
            }
            None => {
                self.ledger.forget_session(session_id);
                Ok(None)
            }
        }
    }

    /// Ownership rows acquired more than `older_than` ago, as (session, credential).
    pub async fn sessions_held_longer_than(
        &self,
        older_than: std::time::Duration,
    ) -> HcResult<Vec<(String, String)>> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| HcError::Config(format!("session age out of range: {}", e)))?;
        let cutoff = (chrono::Utc::now() - age).to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        self.db
            .call("sessions_held_longer_than", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, username FROM credential_sessions
                     WHERE acquired_at < ?1 ORDER BY acquired_at ASC",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?;
                let held = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(held)
            })
            .await
    }

    /// Aggregate capacity counts. No lock is held across the read.
    pub async fn pool_status(&self) -> HcResult<PoolStatus> {
        let status = self.db.call("pool_status", |conn| read_pool_status(conn)).await?;
        metrics::record_pool_status(&status);
        Ok(status)
    }

    pub async fn get_credential(&self, username: &str) -> HcResult<Credential> {
        let name = username.to_string();
        self.db
            .call("get_credential", move |conn| load_credential(conn, &name))
            .await?
            .ok_or_else(|| HcError::NotFound(format!("credential {}", username)))
    }

    /// Insert or update a credential's administrative fields.
    ///
    /// Session counters and ownership are left untouched on update.
    pub async fn upsert_credential(&self, credential: NewCredential) -> HcResult<()> {
        self.db
            .call("upsert_credential", move |conn| {
                conn.execute(
                    "INSERT INTO credentials
                        (username, secret, target_ip, target_port, max_sessions, login_status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(username) DO UPDATE SET
                        secret = excluded.secret,
                        target_ip = excluded.target_ip,
                        target_port = excluded.target_port,
                        max_sessions = excluded.max_sessions,
                        login_status = excluded.login_status",
                    params![
                        credential.username,
                        credential.secret,
                        credential.target_ip,
                        credential.target_port,
                        credential.max_sessions,
                        if credential.enabled { LOGIN_ENABLED } else { "No" },
                    ],
                )
                .map(|_| ())
            })
            .await
    }

    /// Flag a credential as expired (or not). Expired credentials are never handed out.
    pub async fn set_expired(&self, username: &str, expired: bool) -> HcResult<()> {
        let name = username.to_string();
        let changed = self
            .db
            .call("set_expired", move |conn| {
                conn.execute(
                    "UPDATE credentials SET is_expired = ?1 WHERE username = ?2",
                    params![expired, name],
                )
            })
            .await?;
        if changed == 0 {
            return Err(HcError::NotFound(format!("credential {}", username)));
        }
        Ok(())
    }
}

fn acquire_in_tx(conn: &mut Connection, session_id: &str) -> rusqlite::Result<Attempt> {
    // IMMEDIATE takes the write lock before the SELECT, like FOR UPDATE.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let held: Option<String> = tx
        .query_row(
            "SELECT username FROM credential_sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(username) = held {
        return Ok(Attempt::AlreadyHeld(username));
    }

    let candidate: Option<String> = tx
        .query_row(
            "SELECT username FROM credentials
             WHERE login_status = ?1
               AND is_expired = 0
               AND current_sessions < max_sessions
             ORDER BY current_sessions ASC, last_used_at ASC
             LIMIT 1",
            params![LOGIN_ENABLED],
            |row| row.get(0),
        )
        .optional()?;
    let Some(username) = candidate else {
        return Ok(Attempt::NoneAvailable);
    };

    let now = now_timestamp();
    let updated = tx.execute(
        "UPDATE credentials
         SET current_sessions = current_sessions + 1,
             last_used_at = ?1,
             total_usage_count = total_usage_count + 1
         WHERE username = ?2 AND current_sessions < max_sessions",
        params![now, username],
    )?;
    if updated != 1 {
        return Ok(Attempt::NoneAvailable);
    }

    tx.execute(
        "INSERT INTO credential_sessions (session_id, username, acquired_at) VALUES (?1, ?2, ?3)",
        params![session_id, username, now],
    )?;

    let credential = load_credential(&tx, &username)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    tx.commit()?;
    Ok(Attempt::Acquired(credential))
}

fn release_in_tx(conn: &mut Connection, username: &str, session_id: &str) -> rusqlite::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let removed = tx.execute(
        "DELETE FROM credential_sessions WHERE session_id = ?1 AND username = ?2",
        params![session_id, username],
    )?;
    if removed == 1 {
        tx.execute(
            "UPDATE credentials SET current_sessions = MAX(current_sessions - 1, 0) WHERE username = ?1",
            params![username],
        )?;
    }
    tx.commit()?;
    Ok(removed == 1)
}
