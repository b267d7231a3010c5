//! Read-only status view returned by the control API.

use super::scaling::ScalingDecision;
use crate::batch::BatchProcessorStats;
use crate::cache::CacheStats;
use crate::config::LoadBalancingConfig;
use crate::workers::{CircuitBreakerState, SystemHealthSnapshot, WorkerDescriptor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Full health snapshot plus per-worker detail and balancing configuration
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub health: SystemHealthSnapshot,
    pub workers: Vec<WorkerDescriptor>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerState>,
    pub pending_recoveries: Vec<String>,
    pub selection_strategy: String,
    pub load_balancing: LoadBalancingConfig,
    pub cache: CacheStats,
    pub batch: BatchProcessorStats,
    pub active_jobs: usize,
    pub last_scaling_decision: Option<ScalingDecision>,
    pub generated_at: DateTime<Utc>,
}

impl SystemStatus {
    pub fn worker(&self, worker_id: &str) -> Option<&WorkerDescriptor> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }

    pub fn is_breaker_open(&self, worker_id: &str) -> bool {
        self.circuit_breakers
            .get(worker_id)
            .map(|b| b.is_open)
            .unwrap_or(false)
    }
}
