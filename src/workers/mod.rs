//! # Worker Health Registry
//!
//! Per-worker load, task and failure accounting, plus the system-wide
//! [`SystemHealthSnapshot`] derived from it.
//!
//! All descriptor and breaker state lives in one [`WorkerHealthRegistry`]
//! behind a single lock; readers receive copies.

pub mod breaker;
pub mod feed;
pub mod health;
pub mod registry;

pub use breaker::CircuitBreakerState;
pub use feed::{
    FeedError, HealthProbe, NullHealthProbe, NullWorkerFeed, PoolStats, WorkerFeed,
    WorkerStatusReport,
};
pub use health::{SystemHealthSnapshot, SystemState, WorkerHealthSummary};
pub use registry::{FailureOutcome, WorkerHealthRegistry};

use crate::constants::selection::DEFAULT_AFFINITY;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Active,
    Idle,
    Busy,
    Failed,
    Offline,
}

impl WorkerState {
    /// States that count toward `worker_health`
    pub fn is_serving(&self) -> bool {
        matches!(self, WorkerState::Active | WorkerState::Idle)
    }
}

/// Resource gauges reported with heartbeats
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Work queued on the worker but not yet started
    pub queue_depth: u32,
}

/// Registry's view of one worker
///
/// `load` and `state` are derived by the registry; callers only ever hold copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub worker_id: String,
    pub state: WorkerState,
    /// `active_tasks / max_tasks_per_worker`, clamped to [0, 1]
    pub load: f64,
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Moving average in milliseconds
    pub response_time_ms: f64,
    pub last_activity: DateTime<Utc>,
    pub resource_usage: ResourceUsage,
    /// Per-task-type weight multipliers; unknown types use 1.0
    pub affinities: HashMap<String, f64>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerDescriptor {
    pub fn new(worker_id: impl Into<String>, affinities: HashMap<String, f64>) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            state: WorkerState::Idle,
            load: 0.0,
            active_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            response_time_ms: 0.0,
            last_activity: now,
            resource_usage: ResourceUsage::default(),
            affinities,
            registered_at: now,
        }
    }

    /// Finished tasks (completed plus failed)
    pub fn finished_tasks(&self) -> u64 {
        self.completed_tasks + self.failed_tasks
    }

    /// 1.0 until the worker has finished a task
    pub fn success_rate(&self) -> f64 {
        match self.finished_tasks() {
            0 => 1.0,
            finished => self.completed_tasks as f64 / finished as f64,
        }
    }

    pub fn failure_ratio(&self) -> f64 {
        1.0 - self.success_rate()
    }

    pub fn affinity_for(&self, task_type: &str) -> f64 {
        self.affinities
            .get(task_type)
            .copied()
            .unwrap_or(DEFAULT_AFFINITY)
    }
}
