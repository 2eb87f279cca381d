// src/utils/retry.rs
use std::future::Future;
use std::time::Duration;

use crate::errors::{KestrelError, KestrelResult};

/// Capped exponential backoff for transient upstream faults.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            factor: 2,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base * self.factor.saturating_pow(attempt)
    }
}

/// Run `op`, retrying transient failures per the policy. Non-transient errors
/// propagate immediately; the last transient error propagates once retries
/// are exhausted.
pub async fn with_backoff<T, F, Fut>(
    op_name: &str,
    policy: RetryPolicy,
    op: F,
) -> KestrelResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = KestrelResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    "{} failed (attempt {}), retrying in {:?}: {}",
                    op_name,
                    attempt + 1,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test-op", RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(KestrelError::unavailable("flaky"))
            } else {
                Ok(7u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries() {
        let calls = AtomicU32::new(0);
        let result: KestrelResult<u32> =
            with_backoff("test-op", RetryPolicy::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(KestrelError::unavailable("down"))
            })
            .await;

        assert!(result.is_err());
        // Initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: KestrelResult<u32> =
            with_backoff("test-op", RetryPolicy::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(KestrelError::conflict("cas miss"))
            })
            .await;

        assert!(matches!(result, Err(KestrelError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
