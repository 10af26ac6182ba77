//! Configuration loading from disk and the environment.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::schema::CoordinatorConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: '{value}'")]
    Env { key: &'static str, value: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load, override from the process environment, and validate.
///
/// A missing file is not an error: defaults plus environment are used.
pub fn load_config(path: Option<&Path>) -> Result<CoordinatorConfig, ConfigError> {
    let mut config = match path {
        Some(path) => parse_file(path)?,
        None => CoordinatorConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate a TOML file without consulting the environment.
pub fn load_file(path: &Path) -> Result<CoordinatorConfig, ConfigError> {
    let config = parse_file(path)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn parse_file(path: &Path) -> Result<CoordinatorConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Apply environment-style overrides on top of a parsed config.
///
/// `lookup` abstracts the environment so tests never touch process state.
pub fn apply_env_overrides<F>(config: &mut CoordinatorConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("DB_PATH") {
        config.database.path = PathBuf::from(v);
    }
    if let Some(v) = get("LOG_LEVEL") {
        config.observability.log_level = v.to_lowercase();
    }
    if let Some(v) = get("MAX_CONCURRENT_CHECKS") {
        config.checks.max_concurrent_checks = v.trim().parse().map_err(|_| ConfigError::Env {
            key: "MAX_CONCURRENT_CHECKS",
            value: v.clone(),
        })?;
    }
    if let Some(v) = get("HC_POLL_INTERVAL") {
        let d = parse_duration(&v).ok_or_else(|| ConfigError::Env {
            key: "HC_POLL_INTERVAL",
            value: v.clone(),
        })?;
        config.pool.poll_interval_ms = d.as_millis() as u64;
    }
    if let Some(v) = get("HC_MAX_WAIT") {
        let d = parse_duration(&v).ok_or_else(|| ConfigError::Env {
            key: "HC_MAX_WAIT",
            value: v.clone(),
        })?;
        config.pool.max_wait_ms = d.as_millis() as u64;
    }
    if let Some(v) = get("HC_SERIALIZE_ACQUIRE") {
        config.pool.serialize_attempts = parse_bool(&v).ok_or_else(|| ConfigError::Env {
            key: "HC_SERIALIZE_ACQUIRE",
            value: v.clone(),
        })?;
    }
    if let Some(v) = get("HC_TRANSITION_POLICY") {
        config.status.transition_policy = v.parse().map_err(|_| ConfigError::Env {
            key: "HC_TRANSITION_POLICY",
            value: v.clone(),
        })?;
    }
    if let Some(v) = get("METRICS_ADDRESS") {
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = v;
    }
    Ok(())
}

/// Parse `500ms`, `30s`, `80m`, `2h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(value)),
        "ms" => Some(Duration::from_millis(value)),
        "m" => Some(Duration::from_secs(value.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(value.checked_mul(3_600)?)),
        _ => None,
    }
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
