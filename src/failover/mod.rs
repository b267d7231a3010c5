//! # Failover Controller
//!
//! Quarantines failing workers and brings them back.
//!
//! ## State machine (per worker)
//!
//! ```text
//! Active/Idle/Busy --(breaker_open_threshold failures)--> breaker open + recovery task
//!                  --(failure_threshold failures)-------> Failed
//! open/Failed --(delay elapsed, breaker timeout elapsed,
//!                recovery_threshold passed probes)------> Active, counters zeroed
//! ```
//!
//! Recovery waits `min(max_delay, base_delay * attempt)` before each probe
//! and retries until it succeeds, the worker is deregistered, or the
//! controller shuts down. A failure that lands while a probe is in flight
//! invalidates that probe: the restore is refused and probing starts over.

use crate::config::FailoverConfig;
use crate::error::Result;
use crate::workers::{FailureOutcome, HealthProbe, WorkerDescriptor, WorkerHealthRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

struct RecoveryTask {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct FailoverInner {
    registry: Arc<WorkerHealthRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: FailoverConfig,
    recovery_threshold: u32,
    recoveries: Mutex<HashMap<String, RecoveryTask>>,
    /// Replaced by `reopen` after a shutdown
    shutdown: Mutex<CancellationToken>,
    next_task_id: AtomicU64,
}

impl FailoverInner {
    fn new(
        registry: Arc<WorkerHealthRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: FailoverConfig,
        recovery_threshold: u32,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            recovery_threshold: recovery_threshold.max(1),
            recoveries: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            next_task_id: AtomicU64::new(1),
        }
    }

    fn recovery_delay(&self, attempt: u32) -> Duration {
        self.config
            .recovery_base_delay()
            .saturating_mul(attempt.max(1))
            .min(self.config.recovery_max_delay())
    }

    /// Try to end recovery task `task_id`; returns false when the task must
    /// keep probing.
    ///
    /// With `restore` set, the worker is restored only if its breaker
    /// generation still matches. Without it, the task ends only if the worker
    /// is no longer quarantined. Both checks run under the recoveries lock,
    /// so a concurrent failure either sees this task still registered or
    /// finds the slot empty and schedules a fresh one.
    fn finish_recovery(
        &self,
        worker_id: &str,
        task_id: u64,
        cancel: &CancellationToken,
        restore: Option<u64>,
    ) -> bool {
        let mut recoveries = self.recoveries.lock();
        if cancel.is_cancelled() {
            return true;
        }

        let done = match restore {
            Some(generation) => match self.registry.restore_if_unchanged(worker_id, generation) {
                Ok(restored) => restored,
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Restore skipped");
                    true
                }
            },
            None => self.registry.quarantine_generation(worker_id).is_none(),
        };

        if done && recoveries.get(worker_id).is_some_and(|task| task.id == task_id) {
            recoveries.remove(worker_id);
        }
        done
    }
}

/// Controller handle; clones share state
#[derive(Clone)]
pub struct FailoverController {
    inner: Arc<FailoverInner>,
}

impl std::fmt::Debug for FailoverController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverController")
            .field("config", &self.inner.config)
            .field("recovery_threshold", &self.inner.recovery_threshold)
            .field("pending_recoveries", &self.inner.recoveries.lock().len())
            .finish()
    }
}

impl FailoverController {
    pub fn new(
        registry: Arc<WorkerHealthRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: FailoverConfig,
        recovery_threshold: u32,
    ) -> Self {
        Self {
            inner: Arc::new(FailoverInner::new(registry, probe, config, recovery_threshold)),
        }
    }

    /// Report a failed task or probe against a worker
    ///
    /// Opening the breaker already schedules recovery: a breaker-open worker
    /// receives no traffic, so it would never reach the Failed threshold.
    pub fn record_failure(&self, worker_id: &str) -> Result<FailureOutcome> {
        let outcome = self.inner.registry.record_failure(worker_id)?;

        if outcome.breaker_opened {
            warn!(
                worker_id = %worker_id,
                failure_count = outcome.failure_count,
                "🔴 FAILOVER: Worker circuit breaker opened"
            );
        }
        if outcome.newly_failed {
            error!(
                worker_id = %worker_id,
                failure_count = outcome.failure_count,
                "🚨 FAILOVER: Worker marked failed"
            );
        }
        if outcome.breaker_opened || outcome.newly_failed {
            self.schedule_recovery(worker_id);
        }
        Ok(outcome)
    }

    /// Report a successful task; resets the consecutive-failure count
    pub fn record_success(&self, worker_id: &str) -> Result<()> {
        self.inner.registry.record_success(worker_id)
    }

    /// Quarantine a worker now; repeated calls leave the same end state
    #[instrument(skip(self))]
    pub fn force_failover(&self, worker_id: &str) -> Result<()> {
        let newly_failed = self.inner.registry.force_fail(worker_id)?;
        if newly_failed {
            warn!(worker_id = %worker_id, "🚨 FAILOVER: Forced failover");
        } else {
            debug!(worker_id = %worker_id, "Forced failover on already-failed worker");
        }
        self.schedule_recovery(worker_id);
        Ok(())
    }

    /// Close a worker's breaker; a failed worker stays failed until recovery
    pub fn reset_circuit_breaker(&self, worker_id: &str) -> Result<()> {
        self.inner.registry.reset_breaker(worker_id)?;
        info!(worker_id = %worker_id, "🟢 FAILOVER: Circuit breaker reset");
        Ok(())
    }

    /// Remove a worker permanently, cancelling any pending recovery
    pub fn deregister_worker(&self, worker_id: &str) -> Result<WorkerDescriptor> {
        self.cancel_recovery(worker_id);
        self.inner.registry.deregister_worker(worker_id)
    }

    pub fn cancel_recovery(&self, worker_id: &str) -> bool {
        match self.inner.recoveries.lock().remove(worker_id) {
            Some(task) => {
                task.cancel.cancel();
                debug!(worker_id = %worker_id, "Recovery cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_recovering(&self, worker_id: &str) -> bool {
        self.inner
            .recoveries
            .lock()
            .get(worker_id)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn pending_recoveries(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.recoveries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn registry(&self) -> &Arc<WorkerHealthRegistry> {
        &self.inner.registry
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.lock().is_cancelled()
    }

    /// Cancel and join every recovery task
    pub async fn shutdown(&self) {
        self.inner.shutdown.lock().cancel();
        let tasks: Vec<RecoveryTask> = self
            .inner
            .recoveries
            .lock()
            .drain()
            .map(|(_, task)| task)
            .collect();

        let count = tasks.len();
        for task in tasks {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Recovery task ended abnormally");
                }
            }
        }
        info!(joined = count, "🛑 FAILOVER: Controller shut down");
    }

    /// Accept recoveries again after `shutdown`, rescheduling one for every
    /// worker still quarantined; no-op while running
    pub fn reopen(&self) {
        {
            let mut shutdown = self.inner.shutdown.lock();
            if !shutdown.is_cancelled() {
                return;
            }
            *shutdown = CancellationToken::new();
        }

        let quarantined = self.inner.registry.quarantined_workers();
        info!(quarantined = quarantined.len(), "🔄 FAILOVER: Controller reopened");
        for worker_id in quarantined {
            self.schedule_recovery(&worker_id);
        }
    }

    /// At most one recovery task per worker
    fn schedule_recovery(&self, worker_id: &str) {
        let mut recoveries = self.inner.recoveries.lock();
        let cancel = {
            let shutdown = self.inner.shutdown.lock();
            if shutdown.is_cancelled() {
                debug!(worker_id = %worker_id, "Controller shut down, recovery not scheduled");
                return;
            }
            shutdown.child_token()
        };

        if let Some(existing) = recoveries.get(worker_id) {
            if !existing.handle.is_finished() {
                return;
            }
        }

        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(recovery_loop(
            Arc::clone(&self.inner),
            worker_id.to_string(),
            id,
            cancel.clone(),
        ));
        recoveries.insert(worker_id.to_string(), RecoveryTask { id, cancel, handle });
        info!(worker_id = %worker_id, "🔧 FAILOVER: Recovery scheduled");
    }
}

async fn recovery_loop(
    inner: Arc<FailoverInner>,
    worker_id: String,
    task_id: u64,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut consecutive_successes: u32 = 0;
    let mut observed_generation: Option<u64> = None;

    loop {
        attempt = attempt.saturating_add(1);
        let breaker_wait = inner
            .registry
            .breaker_remaining(&worker_id)
            .unwrap_or_default();
        let wait = inner.recovery_delay(attempt).max(breaker_wait);

        debug!(
            worker_id = %worker_id,
            attempt,
            wait_ms = wait.as_millis() as u64,
            "Waiting before recovery probe"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(generation) = inner.registry.quarantine_generation(&worker_id) else {
            if inner.finish_recovery(&worker_id, task_id, &cancel, None) {
                debug!(worker_id = %worker_id, "Worker serving or gone, recovery not needed");
                return;
            }
            continue;
        };
        if observed_generation != Some(generation) {
            // Passes against an older failure do not count toward this one
            consecutive_successes = 0;
            observed_generation = Some(generation);
        }

        let probe = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(inner.config.probe_timeout(), inner.probe.probe(&worker_id)) => result,
        };

        match probe {
            Ok(Ok(())) => {
                consecutive_successes += 1;
                if consecutive_successes < inner.recovery_threshold {
                    debug!(
                        worker_id = %worker_id,
                        consecutive_successes,
                        required = inner.recovery_threshold,
                        "Recovery probe passed"
                    );
                    continue;
                }
                if inner.finish_recovery(&worker_id, task_id, &cancel, Some(generation)) {
                    if !cancel.is_cancelled() {
                        info!(
                            worker_id = %worker_id,
                            attempts = attempt,
                            "✅ FAILOVER: Worker restored"
                        );
                    }
                    return;
                }
                consecutive_successes = 0;
                warn!(worker_id = %worker_id, attempt, "Worker failed again during recovery, probing again");
            }
            Ok(Err(e)) => {
                consecutive_successes = 0;
                warn!(worker_id = %worker_id, attempt, error = %e, "Recovery probe failed");
            }
            Err(_) => {
                consecutive_successes = 0;
                warn!(
                    worker_id = %worker_id,
                    attempt,
                    timeout_ms = inner.config.probe_timeout_ms,
                    "Recovery probe timed out"
                );
            }
        }
    }
}
