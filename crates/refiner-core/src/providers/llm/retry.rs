//! Exponential backoff for transient provider failures.

use crate::errors::ProviderError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }
}

/// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
    config.base_delay.saturating_mul(exp)
}

/// Run `op` until it succeeds, fails non-transiently, or the attempt budget is
/// spent. A rate-limit hint larger than the computed delay wins.
pub async fn with_backoff<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => {
                if attempt > 1 {
                    debug!(provider = label, attempt, "request succeeded after retry");
                }
                return Ok(v);
            }
            Err(err) => {
                if !err.is_transient() || attempt >= max_attempts {
                    return Err(err);
                }
                let mut delay = compute_delay(config, attempt);
                if let ProviderError::RateLimited { retry_after_ms } = &err {
                    delay = delay.max(Duration::from_millis(*retry_after_ms));
                }
                warn!(
                    event = "llm_retry",
                    provider = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient provider failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_double_from_base() {
        let cfg = RetryConfig::default();
        let delays: Vec<u64> = (1..=4).map(|a| compute_delay(&cfg, a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_is_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = with_backoff(&RetryConfig::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::AuthFailed("bad key".into())) }
        })
        .await;
        assert!(matches!(res, Err(ProviderError::AuthFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_delay() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let res = with_backoff(&RetryConfig::default(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ProviderError::RateLimited {
                        retry_after_ms: 7_000,
                    })
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(res, Ok("ok"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));
    }
}
