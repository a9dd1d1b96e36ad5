//! Retry policies.
//!
//! Used in two places: bounded retry of ledger conflicts inside the engine, and
//! connection-level retry of store/broker dependencies at startup.

use std::future::Future;
use std::time::Duration;

/// Delay schedule between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^(retry - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first try (0 = try once).
    pub retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// Conflict retry for engine steps: 3 retries starting at 10ms.
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(10),
                max: Duration::from_millis(200),
            },
        }
    }
}

impl RetryPolicy {
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Startup policy for store/broker connections: 12 tries, 5 seconds apart.
    pub fn startup() -> Self {
        Self::fixed(11, Duration::from_secs(5))
    }

    /// Total tries the policy allows, first one included.
    pub fn tries(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_before(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32 << retry.saturating_sub(1).min(31);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the policy
/// is exhausted. Returns the last error.
pub async fn retry_async<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut retryable: R,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut retry = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if retry < policy.retries && retryable(&err) => {
                retry += 1;
                let delay = policy.delay_before(retry);
                tracing::warn!(
                    operation,
                    retry,
                    retries = policy.retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
