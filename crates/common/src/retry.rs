//! Bounded exponential backoff for transient failures.

use std::{future::Future, time::Duration};

use thiserror::Error;
use tracing::warn;

/// Retry schedule for transient errors: delays grow geometrically from
/// `base_delay` up to `max_delay`, for at most `max_attempts` tries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            factor: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-based). Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let mult = self.factor.saturating_pow(attempt - 1);
        self.base_delay
            .saturating_mul(mult)
            .min(self.max_delay)
    }
}

/// A transient operation that exhausted its retry budget.
#[derive(Debug, Error)]
#[error("delivery failed after {attempts} attempts: {last_error}")]
pub struct DeliveryFailure<E: std::error::Error> {
    pub attempts: u32,
    #[source]
    pub last_error: E,
}

/// Runs `op` until it succeeds or the policy is exhausted.
///
/// Every failed attempt is logged; the final error is wrapped in a
/// [`DeliveryFailure`] so callers can observe the exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, DeliveryFailure<E>>
where
    E: std::error::Error,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_error = None;
    for attempt in 0..policy.max_attempts {
        let delay = policy.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(%label, attempt, error = %err, "transient operation failed");
                last_error = Some(err);
            }
        }
    }

    Err(DeliveryFailure {
        attempts: policy.max_attempts,
        last_error: last_error.expect("at least one attempt"),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            factor: 2,
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
        }
    }

    #[test]
    fn delays_grow_and_clamp() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(std::io::Error::other("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts() {
        let result: Result<(), _> = retry_with_backoff(fast_policy(), "test", || async {
            Err::<(), _>(std::io::Error::other("down"))
        })
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 3);
    }
}
