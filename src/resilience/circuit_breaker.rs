//! # Circuit Breaker
//!
//! Three-state guard around a shared dependency. Callers ask
//! [`CircuitBreaker::should_allow`] before an operation and report the
//! outcome with [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`].
//!
//! All state sits behind one `parking_lot` mutex that is only held for the
//! duration of a transition, never across an await.

use crate::resilience::CircuitBreakerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the timeout elapses
    Open,
    /// A limited number of trial calls decide whether to close again
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u64,
    trial_successes: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        debug!(
            component = %name,
            failure_threshold = config.failure_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                trial_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.inner.lock().consecutive_failures
    }

    /// Whether the next operation may run
    ///
    /// An Open breaker past its timeout moves to HalfOpen and admits the caller.
    pub fn should_allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.timeout);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_successes = 0;
                    info!(component = %self.name, "🟡 Circuit breaker half-open");
                }
                expired
            }
        }
    }

    /// Time until an Open breaker admits a trial call; `None` unless Open
    pub fn remaining_open_time(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => {
                Some(self.config.timeout.saturating_sub(at.elapsed()))
            }
            _ => None,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.success_threshold.max(1) {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    info!(component = %self.name, "🟢 Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;

        let trips = match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures >= u64::from(self.config.failure_threshold.max(1))
            }
            // A failed trial reopens immediately
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trips {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_successes = 0;
            warn!(
                component = %self.name,
                consecutive_failures = inner.consecutive_failures,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "🔴 Circuit breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, timeout: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            CircuitBreakerConfig {
                failure_threshold,
                timeout,
                success_threshold,
            },
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let circuit = breaker(2, Duration::from_secs(1), 1);

        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Closed);
        circuit.record_failure();
        assert!(circuit.is_open());
        assert!(!circuit.should_allow());
        assert!(circuit.remaining_open_time().is_some());
    }

    #[test]
    fn test_success_clears_failure_streak() {
        let circuit = breaker(3, Duration::from_secs(1), 1);

        circuit.record_failure();
        circuit.record_failure();
        circuit.record_success();
        circuit.record_failure();

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trials_close_the_breaker() {
        let circuit = breaker(1, Duration::from_millis(50), 2);
        circuit.record_failure();

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(circuit.should_allow());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        circuit.record_success();
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        circuit.record_success();
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(circuit.remaining_open_time().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let circuit = breaker(1, Duration::from_millis(10), 1);
        circuit.record_failure();

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(circuit.should_allow());

        circuit.record_failure();
        assert!(circuit.is_open());
        assert!(!circuit.should_allow());
    }
}
