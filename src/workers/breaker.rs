//! Per-worker circuit breaker state.
//!
//! Unlike [`crate::resilience::CircuitBreaker`], this breaker never closes
//! on time alone: the timeout only makes a worker *eligible* for a recovery
//! probe, and only a successful probe (or an explicit reset) closes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub is_open: bool,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub timeout: Duration,
    #[serde(skip)]
    opened_at: Option<Instant>,
    /// Bumped on every failure and forced open; a restore only applies to
    /// the generation its probe observed
    #[serde(skip)]
    generation: u64,
}

impl CircuitBreakerState {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_count: 0,
            is_open: false,
            last_failure_time: None,
            threshold: threshold.max(1),
            timeout,
            opened_at: None,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Count a failure; returns true when this failure opened the breaker
    pub fn record_failure(&mut self) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.generation += 1;
        self.last_failure_time = Some(Utc::now());
        if !self.is_open && self.failure_count >= self.threshold {
            self.open();
            return true;
        }
        false
    }

    /// Open without counting; failure count is raised to the threshold
    pub fn force_open(&mut self) {
        self.failure_count = self.failure_count.max(self.threshold);
        self.generation += 1;
        if !self.is_open {
            self.open();
        }
    }

    fn open(&mut self) {
        self.is_open = true;
        self.opened_at = Some(Instant::now());
    }

    /// Close and zero the failure count
    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.is_open = false;
        self.opened_at = None;
    }

    /// Time left before a recovery probe is allowed; zero once elapsed or closed
    pub fn remaining_timeout(&self) -> Duration {
        match (self.is_open, self.opened_at) {
            (true, Some(opened_at)) => self.timeout.saturating_sub(opened_at.elapsed()),
            _ => Duration::ZERO,
        }
    }
}
