//! Batch-size heuristic.
//!
//! This is a coarse heuristic, not a fitted optimizer. The window is scanned
//! for the batch with the highest observed throughput and a chunk size is
//! *estimated* from that batch as `total_items / 5`, clamped to `[5, 50]`.
//! Until a batch has been observed the configured default is used.

use crate::constants::batch_sizing::{ESTIMATE_DIVISOR, MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Observed performance of one completed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub total_items: usize,
    pub successful_items: usize,
    pub duration: Duration,
    /// Items per second
    pub throughput: f64,
    pub success_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Rolling window of [`PerformanceSample`]s
#[derive(Debug, Clone)]
pub struct BatchSizer {
    history: VecDeque<PerformanceSample>,
    window: usize,
    default_size: usize,
}

impl BatchSizer {
    pub fn new(window: usize, default_size: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(window),
            window: window.max(1),
            default_size: default_size.max(1),
        }
    }

    pub fn record(&mut self, sample: PerformanceSample) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }

    pub fn recommend(&self) -> usize {
        self.history
            .iter()
            .max_by(|a, b| a.throughput.total_cmp(&b.throughput))
            .map(|best| {
                (best.total_items / ESTIMATE_DIVISOR).clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
            })
            .unwrap_or(self.default_size)
    }

    pub fn history(&self) -> Vec<PerformanceSample> {
        self.history.iter().cloned().collect()
    }
}
