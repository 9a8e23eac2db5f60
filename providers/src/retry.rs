use crate::provider::ProviderError;
use cairn_core::config::ProviderConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl From<&ProviderConfig> for RetryPolicy {
    fn from(cfg: &ProviderConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff_factor: cfg.backoff_factor,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry `attempt` (1-based): base · factor^(attempt−1),
    /// capped, with ±25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponential = self.base_delay.as_millis() as f64
            * self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64) as u64;

        if self.jitter {
            let jitter_range = capped / 4;
            if jitter_range > 0 {
                let offset = fastrand::u64(0..=jitter_range * 2);
                return Duration::from_millis(capped - jitter_range + offset);
            }
        }
        Duration::from_millis(capped)
    }
}

/// Retry transient provider failures with backoff. Rate-limit responses
/// that carry a retry-after hint sleep for that hint instead of the
/// computed backoff. Terminal errors return immediately.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_error = None;

    for attempt in 0..=policy.max_retries {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() => {
                debug!(attempt, error = %error, "transient provider failure");
                let delay = match &error {
                    ProviderError::RateLimited {
                        retry_after: Some(hint),
                    } => (*hint).min(policy.max_delay),
                    _ => policy.delay_for(attempt + 1),
                };
                last_error = Some(error);
                if attempt < policy.max_retries && !delay.is_zero() {
                    sleep(delay).await;
                }
            }
            Err(error) => return Err(error),
        }
    }

    Err(last_error.unwrap_or(ProviderError::Exhausted))
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
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(4), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: true,
        };
        for _ in 0..100 {
            let delay = policy.delay_for(1).as_millis() as i64;
            assert!((300..=500).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_transient(&fast_policy(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(ProviderError::Transient("503".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), ProviderError> = retry_transient(&fast_policy(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Terminal("401".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Terminal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_transient_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), ProviderError> = retry_transient(&fast_policy(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Transient("timeout".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Transient(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4); // initial + 3 retries
    }
}
