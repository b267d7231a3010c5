//! Breaker settings derived from the component configuration sections

use crate::config::{BatchConfig, CacheConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a trial call
    pub timeout: Duration,
    /// Trial successes needed to close again
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    /// Breaker guarding the networked cache tier
    pub fn for_cache(config: &CacheConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold.max(1),
            timeout: Duration::from_secs(config.breaker_timeout_seconds),
            success_threshold: 1,
        }
    }

    /// Breaker counting consecutive failed batches
    pub fn for_batch(config: &BatchConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold.max(1),
            timeout: config.circuit_breaker_timeout(),
            success_threshold: 1,
        }
    }
}
