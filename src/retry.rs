//! Capped exponential retry for external API calls. The attempt count and
//! delays are operator configuration, not constants.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. 0 is treated as 1.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { attempts: attempts.max(1), base_delay, max_delay }
    }

    /// One attempt, no waiting. Useful for tests and secondary calls.
    pub fn once() -> Self {
        Self { attempts: 1, base_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `f` until it succeeds or the policy is exhausted, sleeping between
/// attempts. The last error is returned verbatim.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..policy.attempts.max(1) {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt + 1 < policy.attempts {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(op, attempt = attempt + 1, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{op}: no attempts made")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let out: i32 = with_retries(&policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("transient")
                }
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_and_returns_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(4));
        let res: Result<()> = with_retries(&policy, "test", || async { anyhow::bail!("nope") }).await;
        assert!(res.is_err());
        assert_eq!(res.unwrap_err().to_string(), "nope");
    }
}
