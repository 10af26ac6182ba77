//! Priority-ordered proxy selection with outcome bookkeeping.

use std::future::Future;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{HcError, HcResult};
use crate::observability::metrics;
use crate::pool::credential::parse_timestamp;
use crate::store::{now_timestamp, Database};

/// A forward relay used to reach nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proxy {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub user: String,
    /// Lower is preferred.
    pub priority: i64,
    pub is_primary: bool,
    pub is_active: bool,
    pub total_attempts: u64,
    pub failed_attempts: u64,
    /// `(attempts - failures) / attempts`; 1.0 before any attempt.
    pub success_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl Proxy {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Administrative definition of a proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewProxy {
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    pub priority: i64,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

const PROXY_COLUMNS: &str = "name, ip, port, proxy_user, priority, is_primary, is_active,
     total_attempts, failed_attempts, success_rate, last_success, last_failure";

fn proxy_from_row(row: &Row<'_>) -> rusqlite::Result<Proxy> {
    Ok(Proxy {
        name: row.get(0)?,
        ip: row.get(1)?,
        port: row.get(2)?,
        user: row.get(3)?,
        priority: row.get(4)?,
        is_primary: row.get(5)?,
        is_active: row.get(6)?,
        total_attempts: row.get(7)?,
        failed_attempts: row.get(8)?,
        success_rate: row.get(9)?,
        last_success: parse_timestamp(row.get(10)?),
        last_failure: parse_timestamp(row.get(11)?),
    })
}

fn active_proxies(conn: &Connection, limit: Option<u32>) -> rusqlite::Result<Vec<Proxy>> {
    let sql = format!(
        "SELECT {} FROM proxies WHERE is_active = 1 ORDER BY priority ASC, name ASC LIMIT ?1",
        PROXY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let limit = limit.map_or(-1, i64::from);
    let rows = stmt.query_map(params![limit], proxy_from_row)?;
    rows.collect()
}

/// Selects proxies by priority and records how each usage went.
///
/// Stateless: every call re-reads the table, so reprioritization and
/// deactivation apply to the next selection.
#[derive(Debug, Clone)]
pub struct ProxySelector {
    db: Database,
}

impl ProxySelector {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The active proxy with the lowest priority value.
    pub async fn select_proxy(&self) -> HcResult<Proxy> {
        let mut proxies = self
            .db
            .call("select_proxy", |conn| active_proxies(conn, Some(1)))
            .await?;
        proxies
            .pop()
            .ok_or_else(|| HcError::NotFound("active proxy".to_string()))
    }

    /// All active proxies in failover order.
    pub async fn list_active(&self) -> HcResult<Vec<Proxy>> {
        self.db
            .call("list_active_proxies", |conn| active_proxies(conn, None))
            .await
    }

    /// Record a successful usage. Unknown proxies are ignored.
    pub async fn record_success(&self, name: &str) -> HcResult<()> {
        let proxy = name.to_string();
        let now = now_timestamp();
        let changed = self
            .db
            .call("record_proxy_success", move |conn| {
                conn.execute(
                    "UPDATE proxies
                     SET total_attempts = total_attempts + 1,
                         last_success = ?1,
                         success_rate = CAST(total_attempts + 1 - failed_attempts AS REAL)
                                        / (total_attempts + 1)
                     WHERE name = ?2",
                    params![now, proxy],
                )
            })
            .await?;
        self.after_record(name, true, changed);
        Ok(())
    }

    /// Record a failed usage. Unknown proxies are ignored.
    pub async fn record_failure(&self, name: &str) -> HcResult<()> {
        let proxy = name.to_string();
        let now = now_timestamp();
        let changed = self
            .db
            .call("record_proxy_failure", move |conn| {
                conn.execute(
                    "UPDATE proxies
                     SET total_attempts = total_attempts + 1,
                         failed_attempts = failed_attempts + 1,
                         last_failure = ?1,
                         success_rate = CAST(total_attempts - failed_attempts AS REAL)
                                        / (total_attempts + 1)
                     WHERE name = ?2",
                    params![now, proxy],
                )
            })
            .await?;
        self.after_record(name, false, changed);
        Ok(())
    }

    fn after_record(&self, name: &str, success: bool, changed: usize) {
        if changed == 0 {
            tracing::debug!(proxy = name, success, "Outcome for unknown proxy ignored");
            return;
        }
        metrics::record_proxy_outcome(name, success);
        tracing::debug!(proxy = name, success, "Proxy outcome recorded");
    }

    /// Try `attempt` through each active proxy in priority order.
    ///
    /// Every proxy tried gets its outcome recorded. Returns the first
    /// success together with the proxy that produced it, or the last error.
    /// Bookkeeping failures are logged and never mask the attempt's result.
    pub async fn with_failover<F, Fut, T, E>(&self, mut attempt: F) -> HcResult<Result<(Proxy, T), E>>
    where
        F: FnMut(Proxy) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let proxies = self.list_active().await?;
        if proxies.is_empty() {
            return Err(HcError::NotFound("active proxy".to_string()));
        }

        let mut last_err = None;
        for proxy in proxies {
            match attempt(proxy.clone()).await {
                Ok(value) => {
                    if let Err(e) = self.record_success(&proxy.name).await {
                        tracing::error!(proxy = %proxy.name, error = %e, "Failed to record proxy success");
                    }
                    return Ok(Ok((proxy, value)));
                }
                Err(err) => {
                    tracing::warn!(proxy = %proxy.name, error = %err, "Proxy attempt failed, failing over");
                    if let Err(e) = self.record_failure(&proxy.name).await {
                        tracing::error!(proxy = %proxy.name, error = %e, "Failed to record proxy failure");
                    }
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) => Ok(Err(err)),
            None => Err(HcError::NotFound("active proxy".to_string())),
        }
    }

    pub async fn get_proxy(&self, name: &str) -> HcResult<Proxy> {
        let proxy = name.to_string();
        self.db
            .call("get_proxy", move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM proxies WHERE name = ?1", PROXY_COLUMNS),
                    params![proxy],
                    proxy_from_row,
                )
                .optional()
            })
            .await?
            .ok_or_else(|| HcError::NotFound(format!("proxy {}", name)))
    }

    /// Insert or update a proxy's administrative fields. Counters are kept.
    pub async fn upsert_proxy(&self, proxy: NewProxy) -> HcResult<()> {
        self.db
            .call("upsert_proxy", move |conn| {
                conn.execute(
                    "INSERT INTO proxies (name, ip, port, proxy_user, priority, is_primary, is_active)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(name) DO UPDATE SET
                        ip = excluded.ip,
                        port = excluded.port,
                        proxy_user = excluded.proxy_user,
                        priority = excluded.priority,
                        is_primary = excluded.is_primary,
                        is_active = excluded.is_active",
                    params![
                        proxy.name,
                        proxy.ip,
                        proxy.port,
                        proxy.user,
                        proxy.priority,
                        proxy.is_primary,
                        proxy.is_active,
                    ],
                )
                .map(|_| ())
            })
            .await
    }

    pub async fn set_active(&self, name: &str, active: bool) -> HcResult<()> {
        let proxy = name.to_string();
        let changed = self
            .db
            .call("set_proxy_active", move |conn| {
                conn.execute(
                    "UPDATE proxies SET is_active = ?1 WHERE name = ?2",
                    params![active, proxy],
                )
            })
            .await?;
        if changed == 0 {
            return Err(HcError::NotFound(format!("proxy {}", name)));
        }
        tracing::info!(proxy = name, active, "Proxy activation changed");
        Ok(())
    }

    pub async fn set_priority(&self, name: &str, priority: i64) -> HcResult<()> {
        let proxy = name.to_string();
        let changed = self
            .db
            .call("set_proxy_priority", move |conn| {
                conn.execute(
                    "UPDATE proxies SET priority = ?1 WHERE name = ?2",
                    params![priority, proxy],
                )
            })
            .await?;
        if changed == 0 {
            return Err(HcError::NotFound(format!("proxy {}", name)));
        }
        Ok(())
    }
}
