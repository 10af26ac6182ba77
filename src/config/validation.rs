//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (intervals > 0, poll interval within max wait)
//! - Stale threshold must outlast the longest wait or check it could reap
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: CoordinatorConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::CoordinatorConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check a configuration for values that deserialize fine but make no sense.
pub fn validate_config(config: &CoordinatorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.database.path.as_os_str().is_empty() {
        errors.push(ValidationError::new("database.path", "must not be empty"));
    }

    if config.pool.poll_interval_ms == 0 {
        errors.push(ValidationError::new("pool.poll_interval_ms", "must be greater than 0"));
    }
    if config.pool.max_wait_ms == 0 {
        errors.push(ValidationError::new("pool.max_wait_ms", "must be greater than 0"));
    }
    if config.pool.poll_interval_ms > config.pool.max_wait_ms {
        errors.push(ValidationError::new(
            "pool.poll_interval_ms",
            format!(
                "{} exceeds pool.max_wait_ms ({})",
                config.pool.poll_interval_ms, config.pool.max_wait_ms
            ),
        ));
    }
    if config.pool.conflict_backoff_base_ms > config.pool.conflict_backoff_max_ms {
        errors.push(ValidationError::new(
            "pool.conflict_backoff_base_ms",
            "must not exceed pool.conflict_backoff_max_ms",
        ));
    }

    if config.checks.max_concurrent_checks == 0 {
        errors.push(ValidationError::new("checks.max_concurrent_checks", "must be at least 1"));
    }
    if config.checks.schedule_interval_secs == 0 {
        errors.push(ValidationError::new("checks.schedule_interval_secs", "must be greater than 0"));
    }
    if config.checks.reap_interval_secs == 0 {
        errors.push(ValidationError::new("checks.reap_interval_secs", "must be greater than 0"));
    }
    if config.checks.check_timeout_secs == 0 {
        errors.push(ValidationError::new("checks.check_timeout_secs", "must be greater than 0"));
    }
    if config.checks.stale_after_secs == 0 {
        errors.push(ValidationError::new("checks.stale_after_secs", "must be greater than 0"));
    }
    // A queued node is not touched while it waits for a credential, and a
    // connected one not until the check ends.
    let longest_quiet = config.pool.max_wait().max(config.checks.check_timeout());
    if config.checks.stale_after_secs > 0 && config.checks.stale_after() <= longest_quiet {
        errors.push(ValidationError::new(
            "checks.stale_after_secs",
            format!(
                "{} s must exceed both pool.max_wait_ms ({}) and checks.check_timeout_secs ({})",
                config.checks.stale_after_secs,
                config.pool.max_wait_ms,
                config.checks.check_timeout_secs
            ),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
