//! Bounded retry of store conflicts.

use std::future::Future;

use crate::config::PoolConfig;
use crate::error::HcResult;
use crate::resilience::backoff::calculate_backoff;

/// Retry budget for one logical store operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }
}

impl From<&PoolConfig> for RetryPolicy {
    fn from(pool: &PoolConfig) -> Self {
        Self::new(
            pool.conflict_retries,
            pool.conflict_backoff_base_ms,
            pool.conflict_backoff_max_ms,
        )
    }
}

/// Run `f`, retrying while it fails with `HcError::Conflict`.
pub async fn retry_on_conflict<F, Fut, T>(op: &'static str, policy: RetryPolicy, mut f: F) -> HcResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HcResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Err(e) if e.is_conflict() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = calculate_backoff(attempt, policy.base_delay_ms, policy.max_delay_ms);
                tracing::debug!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after store conflict");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
