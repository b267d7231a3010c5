//! Exponential retry delays shared by the cache tier, batch items and pipeline stages.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// `base * multiplier^attempt`, capped at `max`, with optional symmetric jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay (0.0 to 1.0) added or subtracted at random
    pub max_jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_jitter: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Disable jitter; delays become deterministic
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = 0.0;
        self
    }

    /// Delay before retry number `attempt` (0 = first retry)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential =
            self.base_delay.as_secs_f64() * self.multiplier.powi(attempt.min(32) as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(self.apply_jitter(capped).max(0.0))
    }

    fn apply_jitter(&self, delay_secs: f64) -> f64 {
        let range = delay_secs * self.max_jitter.clamp(0.0, 1.0);
        if range <= 0.0 {
            return delay_secs;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0.0..=range);
        if rng.gen_bool(0.5) {
            delay_secs + jitter
        } else {
            delay_secs - jitter
        }
    }

    /// Run `operation` up to `max_attempts` times, sleeping between attempts
    ///
    /// Errors for which `is_retryable` returns false are returned immediately.
    pub async fn retry<T, E, F, Fut, P>(
        &self,
        max_attempts: u32,
        is_retryable: P,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;
                    if attempt >= max_attempts || !is_retryable(&error) {
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "🔄 Retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
