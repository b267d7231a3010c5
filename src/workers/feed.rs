//! External collaborators that report on workers.
//!
//! - [`WorkerFeed`]: periodic pull of worker status from the task runtime
//! - [`HealthProbe`]: bounded liveness check used by failover recovery
//!
//! The `Null*` implementations are the explicit "nothing wired" choice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    #[error("worker feed unavailable: {0}")]
    Unavailable(String),

    #[error("probe of worker {worker_id} failed: {reason}")]
    ProbeFailed { worker_id: String, reason: String },
}

/// Pool-level figures carried in a status report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Recent average response time, if the runtime measures it
    pub response_time_ms: Option<f64>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub queue_depth: u32,
}

/// One worker's entry in a feed poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    pub worker_id: String,
    pub active_task_ids: Vec<String>,
    #[serde(default)]
    pub pool_stats: PoolStats,
}

impl WorkerStatusReport {
    pub fn new(worker_id: impl Into<String>, active_task_ids: Vec<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            active_task_ids,
            pool_stats: PoolStats::default(),
        }
    }
}

/// Source of worker status
///
/// A worker missing from a poll is left as-is; only explicit failures
/// quarantine a worker.
#[async_trait]
pub trait WorkerFeed: Send + Sync {
    async fn poll(&self) -> Result<Vec<WorkerStatusReport>, FeedError>;

    fn name(&self) -> &str {
        "worker_feed"
    }
}

/// Feed that never reports anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWorkerFeed;

#[async_trait]
impl WorkerFeed for NullWorkerFeed {
    async fn poll(&self) -> Result<Vec<WorkerStatusReport>, FeedError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Liveness check against a single worker
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, worker_id: &str) -> Result<(), FeedError>;
}

/// Probe that always passes
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHealthProbe;

#[async_trait]
impl HealthProbe for NullHealthProbe {
    async fn probe(&self, _worker_id: &str) -> Result<(), FeedError> {
        Ok(())
    }
}
