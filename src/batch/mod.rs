//! # Adaptive Batch Processor
//!
//! Bounded-concurrency execution of a caller-supplied unit of work over a
//! collection, with per-item retry, a processor-wide circuit breaker and a
//! batch-size heuristic fed by rolling throughput history.
//!
//! ## Ordering
//!
//! [`AdaptiveBatchProcessor::process_batch`] returns results index-aligned
//! with its input. The streaming variant yields `(index, result)` pairs in
//! completion order instead.

pub mod processor;
pub mod sizing;

pub use processor::{AdaptiveBatchProcessor, BatchProcessorStats};
pub use sizing::{BatchSizer, PerformanceSample};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a unit of work
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkError {
    /// Worth another attempt with the same input
    #[error("retryable: {0}")]
    Retryable(String),

    /// Never retried
    #[error("fatal: {0}")]
    Fatal(String),

    /// The worker executing the item is at fault, not the item
    #[error("worker {worker_id} failed: {reason}")]
    WorkerFailure { worker_id: String, reason: String },
}

impl WorkError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Outcome for one input item; immutable once the item finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult<R> {
    pub success: bool,
    pub data: Option<R>,
    pub error: Option<String>,
    /// Most recent failure, kept typed so callers can route worker failures
    #[serde(skip)]
    pub work_error: Option<WorkError>,
    pub duration: Duration,
    /// Attempts beyond the first
    pub retry_count: u32,
    pub state: ProcessingState,
}

impl<R> ProcessingResult<R> {
    pub fn completed(data: R, duration: Duration, retry_count: u32) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            work_error: None,
            duration,
            retry_count,
            state: ProcessingState::Completed,
        }
    }

    pub fn failed(error: WorkError, duration: Duration, retry_count: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            work_error: Some(error),
            duration,
            retry_count,
            state: ProcessingState::Failed,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            data: None,
            error: Some("cancelled before start".to_string()),
            work_error: None,
            duration: Duration::ZERO,
            retry_count: 0,
            state: ProcessingState::Cancelled,
        }
    }

    /// Carry the outcome over to a different payload type
    pub fn map<S>(self, f: impl FnOnce(R) -> S) -> ProcessingResult<S> {
        ProcessingResult {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
            work_error: self.work_error,
            duration: self.duration,
            retry_count: self.retry_count,
            state: self.state,
        }
    }
}

/// Ordered results of one `process_batch` call
///
/// Derived figures are computed once in [`BatchResult::from_results`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult<R> {
    total_items: usize,
    successful_items: usize,
    failed_items: usize,
    cancelled_items: usize,
    results: Vec<ProcessingResult<R>>,
    total_duration: Duration,
    success_rate: f64,
    throughput: f64,
}

impl<R> BatchResult<R> {
    pub fn from_results(results: Vec<ProcessingResult<R>>, total_duration: Duration) -> Self {
        let total_items = results.len();
        let successful_items = results.iter().filter(|r| r.success).count();
        let cancelled_items = results
            .iter()
            .filter(|r| r.state == ProcessingState::Cancelled)
            .count();

        let success_rate = if total_items == 0 {
            0.0
        } else {
            successful_items as f64 / total_items as f64
        };
        let seconds = total_duration.as_secs_f64();
        let throughput = if seconds > 0.0 {
            total_items as f64 / seconds
        } else {
            0.0
        };

        Self {
            total_items,
            successful_items,
            failed_items: total_items - successful_items,
            cancelled_items,
            results,
            total_duration,
            success_rate,
            throughput,
        }
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn successful_items(&self) -> usize {
        self.successful_items
    }

    /// Includes cancelled items
    pub fn failed_items(&self) -> usize {
        self.failed_items
    }

    pub fn cancelled_items(&self) -> usize {
        self.cancelled_items
    }

    pub fn results(&self) -> &[ProcessingResult<R>] {
        &self.results
    }

    pub fn into_results(self) -> Vec<ProcessingResult<R>> {
        self.results
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    /// Items per second
    pub fn throughput(&self) -> f64 {
        self.throughput
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_result_arithmetic() {
        let mut results = Vec::new();
        for i in 0..10u32 {
            if i < 7 {
                results.push(ProcessingResult::completed(i, Duration::from_millis(10), 0));
            } else {
                results.push(ProcessingResult::failed(
                    WorkError::fatal("bad input"),
                    Duration::from_millis(10),
                    0,
                ));
            }
        }

        let batch = BatchResult::from_results(results, Duration::from_secs(5));
        assert_eq!(batch.total_items(), 10);
        assert_eq!(batch.successful_items(), 7);
        assert_eq!(batch.failed_items(), 3);
        assert!((batch.success_rate() - 0.7).abs() < 1e-9);
        assert!((batch.throughput() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_batch_has_zero_rates() {
        let batch: BatchResult<()> = BatchResult::from_results(Vec::new(), Duration::ZERO);
        assert_eq!(batch.success_rate(), 0.0);
        assert_eq!(batch.throughput(), 0.0);
    }

    #[test]
    fn test_only_fatal_errors_skip_retry() {
        assert!(WorkError::retryable("timeout").is_retryable());
        assert!(!WorkError::fatal("schema").is_retryable());
        assert!(WorkError::WorkerFailure {
            worker_id: "w1".into(),
            reason: "crashed".into()
        }
        .is_retryable());
    }
}
