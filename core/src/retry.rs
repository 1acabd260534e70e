use crate::error::{ErrorKind, GatewayError, GatewayResult};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff configuration for [`Retryer`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: bool,
    /// When set, only these kinds are retried; otherwise the error's own
    /// retryable flag decides.
    pub retryable_kinds: Option<HashSet<ErrorKind>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: true,
            retryable_kinds: None,
        }
    }
}

impl RetryPolicy {
    pub fn no_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn should_retry(&self, err: &GatewayError) -> bool {
        match &self.retryable_kinds {
            Some(kinds) => kinds.contains(&err.kind),
            None => err.retryable,
        }
    }

    /// Delay before attempt `n` (n >= 1): min(max_delay, base * factor^(n-1)),
    /// plus +/-10% uniform jitter when enabled.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.9..=1.1);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Executes an operation up to `max_retries + 1` times with exponential
/// backoff. Returns on first success; aborts immediately on cancellation or a
/// non-retryable error; on exhaustion the last error is returned with a
/// "failed after N retries" detail, preserving its kind.
#[derive(Debug, Clone, Default)]
pub struct Retryer {
    policy: RetryPolicy,
}

impl Retryer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..=self.policy.max_retries {
            if cancel.is_cancelled() {
                return Err(GatewayError::cancelled());
            }

            if attempt > 0 {
                let delay = self.policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.policy.should_retry(&err) {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        let retries = self.policy.max_retries;
        let err = last_err
            .unwrap_or_else(|| GatewayError::internal("RETRY_EXHAUSTED", "no attempts executed"));
        Err(GatewayError {
            message: format!("failed after {} retries: {}", retries, err.message),
            ..err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            factor: 2.0,
            jitter: false,
            retryable_kinds: None,
        }
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let retryer = Retryer::new(fast_policy(3));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = calls.clone();

        let result = retryer
            .execute(&CancellationToken::new(), move |_| {
                let calls = calls_inner.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GatewayError::network("CONN_RESET", "transient"))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_contract_errors() {
        let retryer = Retryer::new(fast_policy(5));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = calls.clone();

        let result: GatewayResult<()> = retryer
            .execute(&CancellationToken::new(), move |_| {
                let calls = calls_inner.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::validation("BAD_INPUT", "nope"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error_and_preserves_kind() {
        let retryer = Retryer::new(fast_policy(2));

        let result: GatewayResult<()> = retryer
            .execute(&CancellationToken::new(), |_| async {
                Err(GatewayError::external("UPSTREAM_5XX", "embed service down"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExternalService);
        assert!(err.message.contains("failed after 2 retries"));
        assert!(err.message.contains("embed service down"));
    }

    #[tokio::test]
    async fn cancellation_aborts_before_next_attempt() {
        let retryer = Retryer::new(fast_policy(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_inner = calls.clone();
        let result: GatewayResult<()> = retryer
            .execute(&cancel, move |_| {
                let calls = calls_inner.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::network("CONN_RESET", "transient"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().code, "CANCELLED");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delays_are_non_decreasing_up_to_cap() {
        let policy = fast_policy(6);
        let mut prev = Duration::ZERO;
        for attempt in 1..=6 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= prev, "delay must not shrink");
            assert!(delay <= policy.max_delay);
            prev = delay;
        }
    }
}
