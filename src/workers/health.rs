//! System health snapshot and classification

use crate::constants::health::{CRITICAL_THRESHOLD, DEGRADED_THRESHOLD, HEALTHY_THRESHOLD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Healthy,
    Degraded,
    Critical,
    Failed,
    Maintenance,
}

impl SystemState {
    /// `>= 0.9` Healthy, `>= 0.7` Degraded, `>= 0.5` Critical, else Failed
    pub fn classify(overall_health: f64) -> Self {
        if overall_health >= HEALTHY_THRESHOLD {
            SystemState::Healthy
        } else if overall_health >= DEGRADED_THRESHOLD {
            SystemState::Degraded
        } else if overall_health >= CRITICAL_THRESHOLD {
            SystemState::Critical
        } else {
            SystemState::Failed
        }
    }
}

/// Worker-side inputs to a snapshot, read under one registry lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealthSummary {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub failed_workers: usize,
    /// `healthy_workers / total_workers`; 0.0 with no workers
    pub worker_health: f64,
    pub issues: Vec<String>,
}

/// Immutable point-in-time health; replaced wholesale each cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthSnapshot {
    pub state: SystemState,
    pub cache_health: f64,
    pub worker_health: f64,
    pub api_health: f64,
    /// Mean of the three component scores
    pub overall_health: f64,
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub failed_workers: usize,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SystemHealthSnapshot {
    pub fn new(
        workers: WorkerHealthSummary,
        cache_health: f64,
        api_health: f64,
        maintenance: bool,
    ) -> Self {
        let cache_health = cache_health.clamp(0.0, 1.0);
        let api_health = api_health.clamp(0.0, 1.0);
        let overall_health = (workers.worker_health + cache_health + api_health) / 3.0;

        let mut issues = workers.issues;
        if cache_health < DEGRADED_THRESHOLD {
            issues.push(format!("cache health low: {cache_health:.2}"));
        }
        if api_health < DEGRADED_THRESHOLD {
            issues.push(format!("upstream API health low: {api_health:.2}"));
        }

        let state = if maintenance {
            SystemState::Maintenance
        } else {
            SystemState::classify(overall_health)
        };

        Self {
            state,
            cache_health,
            worker_health: workers.worker_health,
            api_health,
            overall_health,
            total_workers: workers.total_workers,
            healthy_workers: workers.healthy_workers,
            failed_workers: workers.failed_workers,
            issues,
            timestamp: Utc::now(),
        }
    }

    /// Placeholder used before the first health-check cycle
    pub fn initial() -> Self {
        Self {
            state: SystemState::Healthy,
            cache_health: 1.0,
            worker_health: 1.0,
            api_health: 1.0,
            overall_health: 1.0,
            total_workers: 0,
            healthy_workers: 0,
            failed_workers: 0,
            issues: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}
