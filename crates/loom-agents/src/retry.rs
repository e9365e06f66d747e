//! Bounded retry with exponential backoff + jitter for collaborator calls.
//! Fatal and non-retryable errors surface immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::AgentError;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt`, honoring a server-suggested delay when
    /// one was provided.
    pub fn delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(suggested) = suggested {
            return suggested.min(self.max_delay);
        }
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter = capped * self.jitter_factor;
        let ms = if jitter > 0.0 {
            rand::thread_rng().gen_range((capped - jitter)..=(capped + jitter))
        } else {
            capped
        };
        Duration::from_millis(ms.max(50.0) as u64)
    }
}

/// Run `op` with the policy, retrying retryable errors.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt, e.suggested_delay());
                warn!(
                    agent = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying agent call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Ok::<_, AgentError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retries_retryable_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n < 2 {
                    Err(AgentError::Network("flaky".into()))
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn fatal_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(AgentError::Auth("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(AgentError::Auth(_))));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(AgentError::Network("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn delay_respects_suggested_and_cap() {
        let policy = fast_policy();
        assert_eq!(
            policy.delay(0, Some(Duration::from_millis(3))),
            Duration::from_millis(3)
        );
        assert_eq!(
            policy.delay(0, Some(Duration::from_secs(60))),
            policy.max_delay
        );
        // Exponential growth is capped.
        assert!(policy.delay(10, None) <= Duration::from_millis(50).max(policy.max_delay));
    }
}
