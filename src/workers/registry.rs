//! Worker registry: descriptors, breakers and the failed set behind one lock.
//!
//! `parking_lot::RwLock` is never held across an `.await`; every public
//! method takes the lock, mutates or copies, and releases it before returning.

use super::breaker::CircuitBreakerState;
use super::feed::WorkerStatusReport;
use super::health::{SystemHealthSnapshot, WorkerHealthSummary};
use super::{ResourceUsage, WorkerDescriptor, WorkerState};
use crate::config::{FailoverConfig, LoadBalancingConfig};
use crate::constants::error_rate::MIN_SAMPLE_SIZE;
use crate::constants::selection::MAX_SELECTABLE_LOAD;
use crate::error::{ConductorError, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Weight of the newest sample in the response-time moving average
const RESPONSE_TIME_SMOOTHING: f64 = 0.2;

#[derive(Debug, Default)]
struct RegistryState {
    workers: HashMap<String, WorkerDescriptor>,
    breakers: HashMap<String, CircuitBreakerState>,
    failed: HashSet<String>,
    offline: HashSet<String>,
}

impl RegistryState {
    /// Recompute `load` and `state` for one worker from the raw counters
    fn refresh(&mut self, worker_id: &str, max_tasks_per_worker: u32) {
        let failed = self.failed.contains(worker_id);
        let offline = self.offline.contains(worker_id);
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.load =
                (worker.active_tasks as f64 / max_tasks_per_worker.max(1) as f64).clamp(0.0, 1.0);
            worker.state = if failed {
                WorkerState::Failed
            } else if offline {
                WorkerState::Offline
            } else if worker.active_tasks == 0 {
                WorkerState::Idle
            } else if worker.load >= MAX_SELECTABLE_LOAD {
                WorkerState::Busy
            } else {
                WorkerState::Active
            };
        }
    }

    fn breaker_open(&self, worker_id: &str) -> bool {
        self.breakers
            .get(worker_id)
            .map(|b| b.is_open)
            .unwrap_or(false)
    }
}

/// Result of recording one failure against a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailureOutcome {
    pub failure_count: u32,
    /// This failure opened the worker's breaker
    pub breaker_opened: bool,
    /// This failure moved the worker into the failed set
    pub newly_failed: bool,
}

/// Owned registry of workers; construct one per orchestrator
#[derive(Debug)]
pub struct WorkerHealthRegistry {
    state: RwLock<RegistryState>,
    max_tasks_per_worker: u32,
    failure_threshold: u32,
    breaker_threshold: u32,
    breaker_timeout: Duration,
    snapshot: RwLock<Arc<SystemHealthSnapshot>>,
    maintenance: AtomicBool,
}

impl WorkerHealthRegistry {
    pub fn new(load_balancing: &LoadBalancingConfig, failover: &FailoverConfig) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_tasks_per_worker: load_balancing.max_tasks_per_worker.max(1),
            failure_threshold: load_balancing.failure_threshold.max(1),
            breaker_threshold: failover.breaker_open_threshold.max(1),
            breaker_timeout: failover.breaker_timeout(),
            snapshot: RwLock::new(Arc::new(SystemHealthSnapshot::initial())),
            maintenance: AtomicBool::new(false),
        }
    }

    /// Register a worker; returns false if it was already known
    ///
    /// Re-registering keeps counters and replaces the affinity table.
    pub fn register_worker(&self, worker_id: &str, affinities: HashMap<String, f64>) -> bool {
        let mut state = self.state.write();
        if let Some(existing) = state.workers.get_mut(worker_id) {
            existing.affinities = affinities;
            debug!(worker_id = %worker_id, "Worker already registered, affinities updated");
            return false;
        }

        state.workers.insert(
            worker_id.to_string(),
            WorkerDescriptor::new(worker_id, affinities),
        );
        state.breakers.insert(
            worker_id.to_string(),
            CircuitBreakerState::new(self.breaker_threshold, self.breaker_timeout),
        );
        state.refresh(worker_id, self.max_tasks_per_worker);
        info!(worker_id = %worker_id, "👷 Worker registered");
        true
    }

    /// Permanently remove a worker and its breaker
    pub fn deregister_worker(&self, worker_id: &str) -> Result<WorkerDescriptor> {
        let mut state = self.state.write();
        let descriptor = state
            .workers
            .remove(worker_id)
            .ok_or_else(|| not_found(worker_id))?;
        state.breakers.remove(worker_id);
        state.failed.remove(worker_id);
        state.offline.remove(worker_id);

        info!(
            worker_id = %worker_id,
            active_tasks = descriptor.active_tasks,
            "👋 Worker deregistered"
        );
        Ok(descriptor)
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.state.read().workers.contains_key(worker_id)
    }

    /// Update a worker from a heartbeat; unknown workers are discovered here
    pub fn record_heartbeat(
        &self,
        worker_id: &str,
        active_tasks: u32,
        response_time: Option<Duration>,
        resource_usage: ResourceUsage,
    ) {
        if !self.contains(worker_id) {
            self.register_worker(worker_id, HashMap::new());
        }

        let mut state = self.state.write();
        state.offline.remove(worker_id);
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.active_tasks = active_tasks;
            if let Some(response_time) = response_time {
                blend_response_time(worker, response_time);
            }
            worker.resource_usage = resource_usage;
            worker.last_activity = Utc::now();
        }
        state.refresh(worker_id, self.max_tasks_per_worker);
    }

    /// Apply one poll of the worker feed; returns the number of reports applied
    ///
    /// Workers absent from the poll are left untouched.
    pub fn apply_feed(&self, reports: &[WorkerStatusReport]) -> usize {
        for report in reports {
            self.record_heartbeat(
                &report.worker_id,
                report.active_task_ids.len() as u32,
                report
                    .pool_stats
                    .response_time_ms
                    .filter(|ms| ms.is_finite() && *ms >= 0.0)
                    .map(|ms| Duration::from_secs_f64(ms / 1000.0)),
                ResourceUsage {
                    cpu_percent: report.pool_stats.cpu_percent,
                    memory_percent: report.pool_stats.memory_percent,
                    queue_depth: report.pool_stats.queue_depth,
                },
            );
        }
        reports.len()
    }

    /// Task-start callback
    pub fn record_task_started(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| not_found(worker_id))?;
        worker.active_tasks = worker.active_tasks.saturating_add(1);
        worker.last_activity = Utc::now();
        state.refresh(worker_id, self.max_tasks_per_worker);
        Ok(())
    }

    /// Task-completion callback
    pub fn record_task_completion(
        &self,
        worker_id: &str,
        success: bool,
        response_time: Duration,
    ) -> Result<()> {
        let mut state = self.state.write();
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| not_found(worker_id))?;
        worker.active_tasks = worker.active_tasks.saturating_sub(1);
        if success {
            worker.completed_tasks += 1;
        } else {
            worker.failed_tasks += 1;
        }
        blend_response_time(worker, response_time);
        worker.last_activity = Utc::now();
        state.refresh(worker_id, self.max_tasks_per_worker);
        Ok(())
    }

    /// Count a consecutive failure; opens the breaker and fails the worker at
    /// their respective thresholds
    pub fn record_failure(&self, worker_id: &str) -> Result<FailureOutcome> {
        let mut state = self.state.write();
        if !state.workers.contains_key(worker_id) {
            return Err(not_found(worker_id));
        }

        let breaker = state
            .breakers
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                CircuitBreakerState::new(self.breaker_threshold, self.breaker_timeout)
            });
        let breaker_opened = breaker.record_failure();
        let failure_count = breaker.failure_count;

        let newly_failed =
            failure_count >= self.failure_threshold && state.failed.insert(worker_id.to_string());
        state.refresh(worker_id, self.max_tasks_per_worker);

        Ok(FailureOutcome {
            failure_count,
            breaker_opened,
            newly_failed,
        })
    }

    /// Clear the consecutive-failure count of a worker that is still serving
    ///
    /// An open breaker is left open; only a recovery probe closes it.
    pub fn record_success(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.workers.contains_key(worker_id) {
            return Err(not_found(worker_id));
        }
        let failed = state.failed.contains(worker_id);
        if let Some(breaker) = state.breakers.get_mut(worker_id) {
            if !breaker.is_open && !failed {
                breaker.failure_count = 0;
            }
        }
        Ok(())
    }

    /// Quarantine immediately; returns true only on the transition into Failed
    pub fn force_fail(&self, worker_id: &str) -> Result<bool> {
        let mut state = self.state.write();
        if !state.workers.contains_key(worker_id) {
            return Err(not_found(worker_id));
        }

        let threshold = self.failure_threshold;
        let breaker = state
            .breakers
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                CircuitBreakerState::new(self.breaker_threshold, self.breaker_timeout)
            });
        breaker.force_open();
        breaker.failure_count = breaker.failure_count.max(threshold);
        breaker.last_failure_time = Some(Utc::now());

        let newly_failed = state.failed.insert(worker_id.to_string());
        state.refresh(worker_id, self.max_tasks_per_worker);
        Ok(newly_failed)
    }

    /// Breaker generation of a worker that is failed or breaker-open;
    /// `None` once it is serving again or unknown
    pub fn quarantine_generation(&self, worker_id: &str) -> Option<u64> {
        let state = self.state.read();
        let breaker = state.breakers.get(worker_id)?;
        (breaker.is_open || state.failed.contains(worker_id)).then(|| breaker.generation())
    }

    /// Workers that are failed or breaker-open, sorted
    pub fn quarantined_workers(&self) -> Vec<String> {
        let state = self.state.read();
        let mut ids: Vec<String> = state
            .workers
            .keys()
            .filter(|id| state.failed.contains(*id) || state.breaker_open(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Full restoration after a passed recovery probe
    pub fn restore(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.workers.contains_key(worker_id) {
            return Err(not_found(worker_id));
        }
        Self::restore_locked(&mut state, worker_id, self.max_tasks_per_worker);
        Ok(())
    }

    /// Restore only if no failure landed after `generation` was observed;
    /// returns whether the worker was restored
    pub fn restore_if_unchanged(&self, worker_id: &str, generation: u64) -> Result<bool> {
        let mut state = self.state.write();
        if !state.workers.contains_key(worker_id) {
            return Err(not_found(worker_id));
        }
        let current = state.breakers.get(worker_id).map(|b| b.generation());
        if current != Some(generation) {
            debug!(
                worker_id = %worker_id,
                observed = generation,
                current = ?current,
                "Restore refused, worker failed again during recovery"
            );
            return Ok(false);
        }
        Self::restore_locked(&mut state, worker_id, self.max_tasks_per_worker);
        Ok(true)
    }

    fn restore_locked(state: &mut RegistryState, worker_id: &str, max_tasks_per_worker: u32) {
        state.failed.remove(worker_id);
        if let Some(breaker) = state.breakers.get_mut(worker_id) {
            breaker.reset();
        }
        if let Some(worker) = state.workers.get_mut(worker_id) {
            // Fresh sample window so the error-rate check does not re-trip at once
            worker.completed_tasks = 0;
            worker.failed_tasks = 0;
            worker.last_activity = Utc::now();
        }
        state.refresh(worker_id, max_tasks_per_worker);
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.state = WorkerState::Active;
        }
    }

    /// Close a worker's breaker and zero its count; failed status is untouched
    pub fn reset_breaker(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let breaker = state
            .breakers
            .get_mut(worker_id)
            .ok_or_else(|| not_found(worker_id))?;
        breaker.reset();
        Ok(())
    }

    /// Take a worker out of rotation without marking it failed
    pub fn set_offline(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.workers.contains_key(worker_id) {
            return Err(not_found(worker_id));
        }
        state.offline.insert(worker_id.to_string());
        state.refresh(worker_id, self.max_tasks_per_worker);
        Ok(())
    }

    pub fn is_failed(&self, worker_id: &str) -> bool {
        self.state.read().failed.contains(worker_id)
    }

    pub fn breaker_state(&self, worker_id: &str) -> Option<CircuitBreakerState> {
        self.state.read().breakers.get(worker_id).cloned()
    }

    /// Time until the worker's open breaker permits a probe
    pub fn breaker_remaining(&self, worker_id: &str) -> Option<Duration> {
        self.state
            .read()
            .breakers
            .get(worker_id)
            .map(|b| b.remaining_timeout())
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerDescriptor> {
        self.state.read().workers.get(worker_id).cloned()
    }

    /// Copies of every descriptor, ordered by id
    pub fn worker_metrics(&self) -> Vec<WorkerDescriptor> {
        let mut workers: Vec<_> = self.state.read().workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn worker_count(&self) -> usize {
        self.state.read().workers.len()
    }

    /// Selection candidates: not failed, not offline, breaker closed, load below 0.9
    pub fn available_workers(&self) -> Vec<WorkerDescriptor> {
        let state = self.state.read();
        let mut available: Vec<_> = state
            .workers
            .values()
            .filter(|w| {
                !state.failed.contains(&w.worker_id)
                    && !state.offline.contains(&w.worker_id)
                    && !state.breaker_open(&w.worker_id)
                    && w.load < MAX_SELECTABLE_LOAD
            })
            .cloned()
            .collect();
        available.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        available
    }

    /// Registered, not failed, not offline and breaker closed; load is not considered
    pub fn is_routable(&self, worker_id: &str) -> bool {
        let state = self.state.read();
        state.workers.contains_key(worker_id)
            && !state.failed.contains(worker_id)
            && !state.offline.contains(worker_id)
            && !state.breaker_open(worker_id)
    }

    /// Mean load over serving (non-failed, non-offline) workers
    pub fn average_load(&self) -> Option<f64> {
        let state = self.state.read();
        let loads: Vec<f64> = state
            .workers
            .values()
            .filter(|w| !state.failed.contains(&w.worker_id) && !state.offline.contains(&w.worker_id))
            .map(|w| w.load)
            .collect();
        if loads.is_empty() {
            None
        } else {
            Some(loads.iter().sum::<f64>() / loads.len() as f64)
        }
    }

    /// Healthy = not failed, breaker closed, state Active or Idle
    pub fn worker_health(&self) -> WorkerHealthSummary {
        let state = self.state.read();
        let total_workers = state.workers.len();
        let mut healthy_workers = 0;
        let mut issues = Vec::new();

        let mut ids: Vec<_> = state.workers.keys().collect();
        ids.sort();
        for worker_id in ids {
            let Some(worker) = state.workers.get(worker_id) else {
                continue;
            };
            let failed = state.failed.contains(worker_id);
            let breaker_open = state.breaker_open(worker_id);
            if failed {
                issues.push(format!("worker {worker_id} failed"));
            } else if breaker_open {
                issues.push(format!("worker {worker_id} circuit breaker open"));
            }
            if !failed && !breaker_open && worker.state.is_serving() {
                healthy_workers += 1;
            }
        }

        let worker_health = if total_workers == 0 {
            issues.push("no workers registered".to_string());
            0.0
        } else {
            healthy_workers as f64 / total_workers as f64
        };

        WorkerHealthSummary {
            total_workers,
            healthy_workers,
            failed_workers: state.failed.len(),
            worker_health,
            issues,
        }
    }

    /// Serving workers whose failure ratio exceeds `max_failure_ratio` over at
    /// least ten finished tasks
    pub fn workers_exceeding_error_rate(&self, max_failure_ratio: f64) -> Vec<String> {
        let state = self.state.read();
        let mut tripped: Vec<String> = state
            .workers
            .values()
            .filter(|w| !state.failed.contains(&w.worker_id))
            .filter(|w| w.finished_tasks() >= MIN_SAMPLE_SIZE)
            .filter(|w| w.failure_ratio() > max_failure_ratio)
            .map(|w| w.worker_id.clone())
            .collect();
        tripped.sort();
        tripped
    }

    /// Aggregate a fresh snapshot from one consistent read
    pub fn build_snapshot(&self, cache_health: f64, api_health: f64) -> SystemHealthSnapshot {
        SystemHealthSnapshot::new(
            self.worker_health(),
            cache_health,
            api_health,
            self.is_maintenance(),
        )
    }

    /// Replace the published snapshot wholesale
    pub fn publish_snapshot(&self, snapshot: SystemHealthSnapshot) -> Arc<SystemHealthSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = Arc::clone(&snapshot);
        snapshot
    }

    pub fn latest_snapshot(&self) -> Arc<SystemHealthSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn set_maintenance(&self, enabled: bool) {
        let previous = self.maintenance.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            warn!(enabled, "🔧 Maintenance mode changed");
        }
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }
}

fn blend_response_time(worker: &mut WorkerDescriptor, sample: Duration) {
    let sample_ms = sample.as_secs_f64() * 1000.0;
    worker.response_time_ms = if worker.response_time_ms == 0.0 {
        sample_ms
    } else {
        worker.response_time_ms * (1.0 - RESPONSE_TIME_SMOOTHING) + sample_ms * RESPONSE_TIME_SMOOTHING
    };
}

fn not_found(worker_id: &str) -> ConductorError {
    ConductorError::WorkerNotFound {
        worker_id: worker_id.to_string(),
    }
}
