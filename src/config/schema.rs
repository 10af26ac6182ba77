//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the coordinator.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the health-check coordinator.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Store location.
    pub database: DatabaseConfig,

    /// Credential pool acquisition settings.
    pub pool: PoolConfig,

    /// Admission control and stale-session reaping.
    pub checks: CheckConfig,

    /// Node status state machine settings.
    pub status: StatusConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/health_check.db"),
        }
    }
}

/// Credential pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Delay between single-shot acquisition attempts.
    pub poll_interval_ms: u64,

    /// Upper bound on how long `acquire` waits for a credential.
    pub max_wait_ms: u64,

    /// Serialize acquisition attempts inside this process.
    pub serialize_attempts: bool,

    /// Transparent retries of an attempt that hit a store conflict.
    pub conflict_retries: u32,

    /// Base delay for conflict retry backoff.
    pub conflict_backoff_base_ms: u64,

    /// Cap for conflict retry backoff.
    pub conflict_backoff_max_ms: u64,
}

impl PoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            max_wait_ms: 80 * 60 * 1_000,
            serialize_attempts: true,
            conflict_retries: 3,
            conflict_backoff_base_ms: 50,
            conflict_backoff_max_ms: 1_000,
        }
    }
}

/// Check admission and bookkeeping configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CheckConfig {
    /// Maximum number of nodes in an in-progress state at once.
    pub max_concurrent_checks: u32,

    /// How often the scheduler looks for nodes due for a check.
    pub schedule_interval_secs: u64,

    /// In-progress checks older than this are considered lost.
    pub stale_after_secs: u64,

    /// How often the reaper sweeps for lost checks.
    pub reap_interval_secs: u64,

    /// Upper bound on one check, connect through completion.
    pub check_timeout_secs: u64,
}

impl CheckConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            max_concurrent_checks: 50,
            schedule_interval_secs: 10,
            stale_after_secs: 2 * 60 * 60,
            reap_interval_secs: 60,
            check_timeout_secs: 30 * 60,
        }
    }
}

/// How the node status tracker treats transitions outside the table.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransitionPolicy {
    /// Apply the transition and log a warning.
    #[default]
    Permissive,
    /// Reject the transition with `InvalidState`.
    Strict,
}

impl std::str::FromStr for TransitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "permissive" => Ok(TransitionPolicy::Permissive),
            "strict" => Ok(TransitionPolicy::Strict),
            _ => Err(format!("Invalid transition policy: {}", s)),
        }
    }
}

/// Node status configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub transition_policy: TransitionPolicy,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Address for the Prometheus scrape endpoint.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.pool.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.pool.max_wait(), Duration::from_secs(80 * 60));
        assert_eq!(config.checks.max_concurrent_checks, 50);
        assert!(config.pool.serialize_attempts);
        assert_eq!(config.status.transition_policy, TransitionPolicy::Permissive);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
            [pool]
            poll_interval_ms = 250

            [status]
            transition_policy = "strict"
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.poll_interval_ms, 250);
        assert_eq!(config.pool.max_wait_ms, PoolConfig::default().max_wait_ms);
        assert_eq!(config.status.transition_policy, TransitionPolicy::Strict);
    }
}
