use nexus_core::NexusResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Retry budget and exponential backoff for task attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts allowed before a task is declared Failed.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Whether a task that has failed `attempt` times gets another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before the retry that follows failure number `attempt`
    /// (1-based): the base delay after the first failure, doubling after
    /// each further one, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_backoff(self, attempt.saturating_sub(1)))
    }
}

/// Exponential backoff for a 0-based retry index, capped at
/// `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// Run a store operation, retrying transient failures with backoff until
/// `window` has elapsed. Non-transient errors return immediately; the last
/// transient error is returned once the window is spent.
pub async fn with_store_retry<T, F, Fut>(
    what: &str,
    window: Duration,
    policy: &RetryPolicy,
    mut op: F,
) -> NexusResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NexusResult<T>>,
{
    let deadline = Instant::now() + window;
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(e);
                }
                let delay = Duration::from_millis(compute_backoff(policy, retry))
                    .min(deadline - now);
                warn!(
                    operation = what,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
                retry = retry.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use nexus_core::NexusError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(compute_backoff(&policy, 0), 100);
        assert_eq!(compute_backoff(&policy, 1), 200);
        assert_eq!(compute_backoff(&policy, 3), 800);
        assert_eq!(compute_backoff(&policy, 4), 1_000);
        assert_eq!(compute_backoff(&policy, 63), 1_000);
        assert_eq!(compute_backoff(&policy, u32::MAX), 1_000);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let never = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert!(!never.should_retry(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_retry_recovers() {
        let calls = AtomicU32::new(0);
        let result = with_store_retry("get", Duration::from_secs(30), &RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(NexusError::StoreUnavailable("down".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_retry_gives_up_after_window() {
        let started = Instant::now();
        let err = with_store_retry("set", Duration::from_secs(5), &RetryPolicy::default(), || async {
            Err::<(), _>(NexusError::StoreUnavailable("down".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_store_retry_passes_other_errors_through() {
        let calls = AtomicU32::new(0);
        let err = with_store_retry("get", Duration::from_secs(5), &RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(NexusError::NotFound("x".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, NexusError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
