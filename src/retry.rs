use std::future::Future;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;
use trigger_plugin::plugin::ProviderError;

use crate::config::EngineConfig;

/// Bounded exponential backoff around provider calls, each call capped by `timeout`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base: config.retry_base,
            max: config.retry_max,
            timeout: config.provider_timeout,
        }
    }

    /// A policy that tries once; used where the caller owns retrying.
    pub fn once(timeout: Duration) -> Self {
        Self { max_attempts: 1, base: Duration::ZERO, max: Duration::ZERO, timeout }
    }

    /// Delay before retry number `attempt` (1-based). Jitter is derived from `seed`
    /// so concurrent workers on different subscriptions spread out but a rerun is
    /// reproducible.
    pub fn backoff(&self, seed: &str, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let baseline = self.base.saturating_mul(1u32 << exp).min(self.max);
        let jitter_bound = (baseline.as_millis() as u64 / 4).max(1);
        let hash = Sha256::digest(format!("{seed}:{attempt}").as_bytes());
        let rand = u16::from_be_bytes([hash[0], hash[1]]) as u64;
        let jitter = Duration::from_millis(rand % (jitter_bound + 1));
        (baseline + jitter).min(self.max)
    }

    /// One call bounded by the timeout. Elapsing is a transient failure, never success.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T, ProviderError>
    where
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    /// Retries transient failures until the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, seed: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match self.call(op()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(seed, attempt);
                    warn!(seed, attempt, delay_ms = delay.as_millis() as u64, error = %err, "provider call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_is_deterministic_and_capped() {
        let policy = RetryPolicy::from_config(&EngineConfig::default());
        let a = policy.backoff("sub-1", 3);
        assert_eq!(a, policy.backoff("sub-1", 3));
        assert!(a >= Duration::from_millis(2_000));
        assert!(policy.backoff("sub-1", 30) <= policy.max);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast()
            .run("s", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::Unavailable("503".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_stop_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast()
            .run("s", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::CredentialExpired("invalid_grant".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::CredentialExpired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let policy = RetryPolicy::once(Duration::from_millis(10));
        let result: Result<(), _> = policy
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout)));
    }
}
