//! Bounded retries and call deadlines.

use crate::config::RetryConfig;
use crate::error::{ReplicatorError, ReplicatorResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with jitter, capped in attempts and delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Build a policy.
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt + 1` (1-based `attempt`), with ±20% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(jitter).min(self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// the attempt budget runs out. The last error is returned.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    retryable: impl Fn(&ReplicatorError) -> bool,
    mut op: F,
) -> ReplicatorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReplicatorResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts() && retryable(&e) => {
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    operation = %operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bound a call with a deadline.
pub async fn with_timeout<T>(
    limit: Duration,
    operation: &str,
    call: impl Future<Output = ReplicatorResult<T>>,
) -> ReplicatorResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ReplicatorError::Timeout {
            operation: operation.to_string(),
            after_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast(), "op", ReplicatorError::is_transient, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ReplicatorError::Transient("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: ReplicatorResult<()> =
            retry(&fast(), "op", ReplicatorError::is_transient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReplicatorError::Transient("busy".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_other_errors() {
        let calls = AtomicU32::new(0);
        let result: ReplicatorResult<()> =
            retry(&fast(), "op", ReplicatorError::is_transient, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReplicatorError::PeerUnusable {
                    cluster: "c1".into(),
                    reason: "revoked".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_transient_error() {
        let result: ReplicatorResult<()> = with_timeout(
            Duration::from_millis(5),
            "create",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, ReplicatorError::Timeout { .. }));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert!(policy.backoff(1) <= Duration::from_millis(120));
        assert!(policy.backoff(2) >= Duration::from_millis(160));
        assert!(policy.backoff(10) <= Duration::from_millis(1000));
    }
}
