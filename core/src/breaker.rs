use crate::error::{ErrorKind, GatewayError, GatewayResult};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in closed state before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting trial calls.
    pub reset_timeout: Duration,
    /// Trial calls admitted in half-open; that many consecutive successes close.
    pub max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            max_requests: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { admitted: u32, successes: u32 },
}

/// Three-state circuit breaker guarding one downstream.
///
/// Closed counts consecutive failures; on reaching the threshold it opens and
/// fails fast with `CIRCUIT_BREAKER_OPEN` until `reset_timeout` elapses, then
/// admits up to `max_requests` trial calls. One trial failure re-opens;
/// `max_requests` consecutive successes close.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Admission check. Transitions open -> half_open after the reset timeout.
    fn try_admit(&self) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Closed { .. } => Ok(()),
            State::Open { since } => {
                if since.elapsed() >= self.config.reset_timeout {
                    debug!(breaker = %self.name, "half-open, admitting trial call");
                    *state = State::HalfOpen {
                        admitted: 1,
                        successes: 0,
                    };
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
            State::HalfOpen {
                ref mut admitted, ..
            } => {
                if *admitted >= self.config.max_requests {
                    Err(self.open_error())
                } else {
                    *admitted += 1;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Closed { ref mut failures } => *failures = 0,
            State::HalfOpen {
                ref mut successes, ..
            } => {
                *successes += 1;
                if *successes >= self.config.max_requests {
                    debug!(breaker = %self.name, "closing after successful probes");
                    *state = State::Closed { failures: 0 };
                }
            }
            State::Open { .. } => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Closed { ref mut failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    warn!(breaker = %self.name, failures, "breaker tripped open");
                    *state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!(breaker = %self.name, "probe failed, re-opening");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    fn open_error(&self) -> GatewayError {
        GatewayError::new(
            ErrorKind::ExternalService,
            CIRCUIT_BREAKER_OPEN,
            format!("circuit breaker '{}' is open", self.name),
        )
    }

    /// Run an operation through the breaker. Fast-fails when open; records the
    /// outcome otherwise.
    pub async fn call<T, F, Fut>(&self, operation: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.try_admit()?;
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64, max_requests: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
                max_requests,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> GatewayResult<()> {
        b.call(|| async { Err(GatewayError::external("UPSTREAM_5XX", "boom")) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> GatewayResult<()> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker(3, 100, 1);

        for _ in 0..3 {
            assert_eq!(fail(&b).await.unwrap_err().code, "UPSTREAM_5XX");
        }
        assert_eq!(b.state(), BreakerState::Open);

        // Calls 4 and 5 fail fast without touching the downstream.
        for _ in 0..2 {
            assert_eq!(fail(&b).await.unwrap_err().code, CIRCUIT_BREAKER_OPEN);
        }
    }

    #[tokio::test]
    async fn probe_after_reset_closes_on_success() {
        let b = breaker(3, 20, 1);
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let b = breaker(2, 20, 1);
        for _ in 0..2 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(fail(&b).await.unwrap_err().code, "UPSTREAM_5XX");
        assert_eq!(b.state(), BreakerState::Open);

        // Timer restarted: still open right away.
        assert_eq!(fail(&b).await.unwrap_err().code, CIRCUIT_BREAKER_OPEN);
    }

    #[tokio::test]
    async fn half_open_requires_consecutive_successes() {
        let b = breaker(1, 10, 2);
        let _ = fail(&b).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_count() {
        let b = breaker(2, 10, 1);
        let _ = fail(&b).await;
        succeed(&b).await.unwrap();
        let _ = fail(&b).await;
        // One failure after a reset does not trip a threshold of two.
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
