//! # Smart Orchestrator
//!
//! Top-level façade composing the cache, batch processor, worker registry,
//! selector, failover controller and pipeline.
//!
//! ## Background loops
//!
//! `start()` spawns two loops, each owning a child of one cancellation token:
//!
//! - **Health check** every `health_check_interval_seconds`: poll the worker
//!   feed, trip workers whose error rate exceeds `circuit_breaker_threshold`,
//!   publish a fresh [`SystemHealthSnapshot`] and alert below
//!   `health_threshold`.
//! - **Resource optimization** every `optimization_interval_seconds`:
//!   evaluate a [`ScalingDecision`], hand it to the [`WorkerScaler`], sweep
//!   expired cache entries and prune finished jobs past their retention.
//!
//! `stop()` cancels the token, joins both loops, then shuts down the
//! pipeline and every pending recovery task. A later `start()` reopens both
//! and reschedules recovery for every worker still quarantined.

pub mod api_health;
pub mod scaling;
pub mod status;

pub use api_health::{ApiHealthSource, StaticApiHealth};
pub use scaling::{NullWorkerScaler, ScalingDecision, ScalingEngine, WorkerScaler};
pub use status::SystemStatus;

use crate::balancer::{LoadBalancer, SelectionStrategy};
use crate::batch::AdaptiveBatchProcessor;
use crate::cache::TieredCache;
use crate::config::{ConductorConfig, ConfigManager};
use crate::error::{ConductorError, Result};
use crate::failover::FailoverController;
use crate::logging::init_structured_logging;
use crate::pipeline::{
    DistributedPipeline, JobHandle, JobOutput, JobStatus, NullScorer, PassThroughHandler, Scorer,
    StageConfig, WorkHandler,
};
use crate::workers::{
    HealthProbe, NullHealthProbe, NullWorkerFeed, SystemHealthSnapshot, WorkerDescriptor,
    WorkerFeed, WorkerHealthRegistry,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

struct OrchestratorInner {
    id: Uuid,
    config: ConductorConfig,
    registry: Arc<WorkerHealthRegistry>,
    balancer: Arc<LoadBalancer>,
    failover: FailoverController,
    processor: Arc<AdaptiveBatchProcessor>,
    cache: Arc<TieredCache>,
    pipeline: DistributedPipeline,
    feed: Arc<dyn WorkerFeed>,
    api_health: Arc<dyn ApiHealthSource>,
    scaler: Arc<dyn WorkerScaler>,
    scaling: ScalingEngine,
    last_scaling_decision: Mutex<Option<ScalingDecision>>,
}

struct BackgroundLoops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Façade over the whole coordination layer
///
/// Each instance owns its registry; several orchestrators can coexist in one
/// process.
pub struct SmartOrchestrator {
    inner: Arc<OrchestratorInner>,
    loops: Mutex<Option<BackgroundLoops>>,
}

impl std::fmt::Debug for SmartOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartOrchestrator")
            .field("id", &self.inner.id)
            .field("strategy", &self.inner.balancer.strategy_name())
            .field("feed", &self.inner.feed.name())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Wires collaborators; anything not supplied gets its null implementation
pub struct SmartOrchestratorBuilder {
    config: ConductorConfig,
    feed: Option<Arc<dyn WorkerFeed>>,
    probe: Option<Arc<dyn HealthProbe>>,
    handler: Option<Arc<dyn WorkHandler>>,
    scorer: Option<Arc<dyn Scorer>>,
    api_health: Option<Arc<dyn ApiHealthSource>>,
    scaler: Option<Arc<dyn WorkerScaler>>,
    strategy: Option<Box<dyn SelectionStrategy>>,
    cache: Option<TieredCache>,
}

impl SmartOrchestratorBuilder {
    pub fn with_worker_feed(mut self, feed: Arc<dyn WorkerFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn WorkHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_api_health(mut self, api_health: Arc<dyn ApiHealthSource>) -> Self {
        self.api_health = Some(api_health);
        self
    }

    pub fn with_scaler(mut self, scaler: Arc<dyn WorkerScaler>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    /// Replace the configured algorithm with a specific strategy instance
    pub fn with_strategy(mut self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Use an already-built cache instead of connecting from configuration
    pub fn with_cache(mut self, cache: TieredCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate configuration and assemble every component
    pub async fn build(self) -> Result<SmartOrchestrator> {
        let config = self.config;
        config.validate()?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => TieredCache::connect(&config.cache).await,
        };
        let cache = Arc::new(cache);

        let registry = Arc::new(WorkerHealthRegistry::new(
            &config.load_balancing,
            &config.failover,
        ));
        let balancer = Arc::new(match self.strategy {
            Some(strategy) => {
                LoadBalancer::with_strategy(Arc::clone(&registry), config.load_balancing.clone(), strategy)
            }
            None => LoadBalancer::new(Arc::clone(&registry), config.load_balancing.clone()),
        });
        let failover = FailoverController::new(
            Arc::clone(&registry),
            self.probe.unwrap_or_else(|| Arc::new(NullHealthProbe)),
            config.failover.clone(),
            config.load_balancing.recovery_threshold,
        );
        let processor = Arc::new(AdaptiveBatchProcessor::new(config.batch.clone()));
        let pipeline = DistributedPipeline::new(
            Arc::clone(&balancer),
            failover.clone(),
            Arc::clone(&processor),
            Arc::clone(&cache),
            self.handler.unwrap_or_else(|| Arc::new(PassThroughHandler)),
            self.scorer.unwrap_or_else(|| Arc::new(NullScorer)),
            config.pipeline.clone(),
        );

        let inner = OrchestratorInner {
            id: Uuid::new_v4(),
            scaling: ScalingEngine::new(&config.load_balancing),
            registry,
            balancer,
            failover,
            processor,
            cache,
            pipeline,
            feed: self.feed.unwrap_or_else(|| Arc::new(NullWorkerFeed)),
            api_health: self
                .api_health
                .unwrap_or_else(|| Arc::new(StaticApiHealth::default())),
            scaler: self.scaler.unwrap_or_else(|| Arc::new(NullWorkerScaler)),
            last_scaling_decision: Mutex::new(None),
            config,
        };

        info!(
            orchestrator_id = %inner.id,
            strategy = inner.balancer.strategy_name(),
            cache_backend = inner.cache.backend_name(),
            feed = inner.feed.name(),
            "🏗️ ORCHESTRATOR: Built"
        );

        Ok(SmartOrchestrator {
            inner: Arc::new(inner),
            loops: Mutex::new(None),
        })
    }
}

impl SmartOrchestrator {
    pub fn builder(config: ConductorConfig) -> SmartOrchestratorBuilder {
        SmartOrchestratorBuilder {
            config,
            feed: None,
            probe: None,
            handler: None,
            scorer: None,
            api_health: None,
            scaler: None,
            strategy: None,
            cache: None,
        }
    }

    /// Load layered configuration, install logging and build with default collaborators
    pub async fn bootstrap() -> Result<SmartOrchestrator> {
        let manager = ConfigManager::load()?;
        init_structured_logging(&manager.config().logging);
        info!(
            environment = manager.environment(),
            config_path = ?manager.config_path(),
            "🚀 ORCHESTRATOR: Bootstrapping"
        );
        Self::builder(manager.config().clone()).build().await
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Spawn the health-check and resource-optimization loops
    #[instrument(skip(self), fields(orchestrator_id = %self.inner.id))]
    pub async fn start(&self) -> Result<()> {
        let mut loops = self.loops.lock();
        if loops.is_some() {
            return Err(ConductorError::InvalidState(
                "orchestrator is already running".to_string(),
            ));
        }

        info!("🚀 ORCHESTRATOR: Starting background loops");
        // A previous stop() shut these down; accept work again
        self.inner.pipeline.reopen();
        self.inner.failover.reopen();

        let cancel = CancellationToken::new();
        let health_interval = self.inner.config.load_balancing.health_check_interval();
        let optimization_interval = self.inner.config.orchestrator.optimization_interval();

        let handles = vec![
            spawn_loop("health_check", health_interval, cancel.child_token(), {
                let inner = Arc::clone(&self.inner);
                move || {
                    let inner = Arc::clone(&inner);
                    async move {
                        inner.health_check_cycle().await;
                    }
                }
            }),
            spawn_loop(
                "resource_optimization",
                optimization_interval,
                cancel.child_token(),
                {
                    let inner = Arc::clone(&self.inner);
                    move || {
                        let inner = Arc::clone(&inner);
                        async move {
                            inner.optimization_cycle().await;
                        }
                    }
                },
            ),
        ];

        *loops = Some(BackgroundLoops { cancel, handles });
        info!("✅ ORCHESTRATOR: Started");
        Ok(())
    }

    /// Cancel and join the loops, then shut down the pipeline and failover
    #[instrument(skip(self), fields(orchestrator_id = %self.inner.id))]
    pub async fn stop(&self) {
        let loops = self.loops.lock().take();
        let Some(loops) = loops else {
            debug!("ORCHESTRATOR: Already stopped");
            return;
        };

        info!("🛑 ORCHESTRATOR: Stopping");
        loops.cancel.cancel();
        for handle in loops.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        self.inner.pipeline.shutdown().await;
        self.inner.failover.shutdown().await;
        info!("✅ ORCHESTRATOR: Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.loops.lock().is_some()
    }

    /// Published snapshot plus per-worker metrics and balancing configuration
    pub fn get_system_status(&self) -> SystemStatus {
        let inner = &self.inner;
        let workers = inner.registry.worker_metrics();
        let circuit_breakers: BTreeMap<_, _> = workers
            .iter()
            .filter_map(|w| {
                inner
                    .registry
                    .breaker_state(&w.worker_id)
                    .map(|breaker| (w.worker_id.clone(), breaker))
            })
            .collect();

        SystemStatus {
            running: self.is_running(),
            health: SystemHealthSnapshot::clone(&inner.registry.latest_snapshot()),
            workers,
            circuit_breakers,
            pending_recoveries: inner.failover.pending_recoveries(),
            selection_strategy: inner.balancer.strategy_name().to_string(),
            load_balancing: inner.config.load_balancing.clone(),
            cache: inner.cache.stats(),
            batch: inner.processor.stats(),
            active_jobs: inner.pipeline.active_jobs().len(),
            last_scaling_decision: *inner.last_scaling_decision.lock(),
            generated_at: Utc::now(),
        }
    }

    /// Run one health-check cycle now and return the published snapshot
    pub async fn run_health_check(&self) -> Arc<SystemHealthSnapshot> {
        self.inner.health_check_cycle().await
    }

    /// Run one resource-optimization cycle now
    pub async fn run_optimization_cycle(&self) -> ScalingDecision {
        self.inner.optimization_cycle().await
    }

    pub fn force_failover(&self, worker_id: &str) -> Result<()> {
        self.inner.failover.force_failover(worker_id)
    }

    pub fn reset_circuit_breaker(&self, worker_id: &str) -> Result<()> {
        self.inner.failover.reset_circuit_breaker(worker_id)
    }

    pub fn register_worker(&self, worker_id: &str, affinities: HashMap<String, f64>) -> bool {
        self.inner.registry.register_worker(worker_id, affinities)
    }

    pub fn deregister_worker(&self, worker_id: &str) -> Result<WorkerDescriptor> {
        self.inner.failover.deregister_worker(worker_id)
    }

    pub fn select_worker(&self, task_type: &str, priority: u8) -> Option<String> {
        self.inner.balancer.select_worker(task_type, priority)
    }

    /// Force the snapshot state to Maintenance until disabled; republishes at once
    pub async fn set_maintenance(&self, enabled: bool) -> Arc<SystemHealthSnapshot> {
        self.inner.registry.set_maintenance(enabled);
        self.inner.publish_snapshot().await
    }

    pub fn submit(&self, items: Vec<Value>, config: StageConfig) -> Result<JobHandle> {
        self.inner.pipeline.submit(items, config)
    }

    pub fn job_status(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.inner.pipeline.job_status(handle)
    }

    pub fn job_output(&self, handle: &JobHandle) -> Result<Option<JobOutput>> {
        self.inner.pipeline.job_output(handle)
    }

    pub fn cancel_job(&self, handle: &JobHandle) -> Result<bool> {
        self.inner.pipeline.cancel(handle)
    }

    pub fn resume_job(&self, handle: &JobHandle) -> Result<()> {
        self.inner.pipeline.resume(handle)
    }

    pub async fn wait_for_job(&self, handle: &JobHandle, timeout: Duration) -> Result<JobStatus> {
        self.inner.pipeline.wait(handle, timeout).await
    }

    /// Forget a finished job and its stored outputs
    pub fn remove_job(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.inner.pipeline.remove_job(handle)
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<WorkerHealthRegistry> {
        &self.inner.registry
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.inner.balancer
    }

    pub fn failover(&self) -> &FailoverController {
        &self.inner.failover
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.inner.cache
    }

    pub fn processor(&self) -> &Arc<AdaptiveBatchProcessor> {
        &self.inner.processor
    }

    pub fn pipeline(&self) -> &DistributedPipeline {
        &self.inner.pipeline
    }
}

impl OrchestratorInner {
    async fn health_check_cycle(&self) -> Arc<SystemHealthSnapshot> {
        match self.feed.poll().await {
            Ok(reports) => {
                let applied = self.registry.apply_feed(&reports);
                debug!(feed = self.feed.name(), applied, "Worker feed applied");
            }
            Err(e) => warn!(feed = self.feed.name(), error = %e, "⚠️ Worker feed poll failed"),
        }

        let threshold = self.config.load_balancing.circuit_breaker_threshold;
        for worker_id in self.registry.workers_exceeding_error_rate(threshold) {
            warn!(
                worker_id = %worker_id,
                threshold,
                "🚨 HEALTH: Worker error rate above threshold, failing over"
            );
            if let Err(e) = self.failover.force_failover(&worker_id) {
                error!(worker_id = %worker_id, error = %e, "Error-rate failover failed");
            }
        }

        let snapshot = self.publish_snapshot().await;
        if snapshot.overall_health < self.config.load_balancing.health_threshold {
            warn!(
                overall_health = snapshot.overall_health,
                health_threshold = self.config.load_balancing.health_threshold,
                state = ?snapshot.state,
                issues = ?snapshot.issues,
                "🚨 ALERT: System health below threshold"
            );
        } else {
            debug!(
                overall_health = snapshot.overall_health,
                state = ?snapshot.state,
                "💓 HEALTH: Cycle complete"
            );
        }
        snapshot
    }

    async fn publish_snapshot(&self) -> Arc<SystemHealthSnapshot> {
        let cache_health = self.cache.health_score().await;
        let api_health = self.api_health.api_health().await;
        let snapshot = self.registry.build_snapshot(cache_health, api_health);
        self.registry.publish_snapshot(snapshot)
    }

    async fn optimization_cycle(&self) -> ScalingDecision {
        let decision = self
            .scaling
            .evaluate(self.registry.average_load(), self.registry.worker_count());

        if decision != ScalingDecision::NoChange {
            info!(decision = ?decision, scaler = self.scaler.name(), "🎛️ SCALING: Applying decision");
            if let Err(e) = self.scaler.apply(decision).await {
                error!(decision = ?decision, error = %e, "Scaling decision not applied");
            }
        }
        *self.last_scaling_decision.lock() = Some(decision);

        let swept = self.cache.sweep_expired().await;
        if swept > 0 {
            debug!(swept, "🧹 Cache sweep removed expired entries");
        }
        self.pipeline
            .prune_finished(self.config.pipeline.finished_job_retention());
        decision
    }
}

/// Run `cycle` every `interval` until `cancel` fires; the first run waits one interval
fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    cycle: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(loop_name = name, interval_ms = interval.as_millis() as u64, "Loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(loop_name = name, "Loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => cycle().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::SystemState;

    async fn orchestrator() -> SmartOrchestrator {
        SmartOrchestrator::builder(ConductorConfig::default())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_with_defaults_uses_memory_cache() {
        let orchestrator = orchestrator().await;
        let status = orchestrator.get_system_status();

        assert!(!status.running);
        assert_eq!(status.cache.backend, "memory");
        assert_eq!(status.selection_strategy, "weighted_round_robin");
        assert!(status.workers.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected_and_stop_is_idempotent() {
        let orchestrator = orchestrator().await;
        orchestrator.start().await.unwrap();
        assert!(orchestrator.is_running());
        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await;
        orchestrator.stop().await;
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_health_check_reflects_workers_and_maintenance() {
        let orchestrator = orchestrator().await;
        for id in ["w1", "w2"] {
            orchestrator.register_worker(id, HashMap::new());
        }

        let snapshot = orchestrator.run_health_check().await;
        assert_eq!(snapshot.total_workers, 2);
        assert_eq!(snapshot.state, SystemState::Healthy);

        let snapshot = orchestrator.set_maintenance(true).await;
        assert_eq!(snapshot.state, SystemState::Maintenance);
        let snapshot = orchestrator.set_maintenance(false).await;
        assert_eq!(snapshot.state, SystemState::Healthy);
    }

    #[tokio::test]
    async fn test_error_rate_trips_worker_during_health_check() {
        let orchestrator = orchestrator().await;
        orchestrator.register_worker("flaky", HashMap::new());
        for i in 0..10 {
            orchestrator
                .registry()
                .record_task_completion("flaky", i < 3, Duration::from_millis(5))
                .unwrap();
        }

        orchestrator.run_health_check().await;
        assert!(orchestrator.registry().is_failed("flaky"));
        assert!(orchestrator.get_system_status().is_breaker_open("flaky"));
        orchestrator.stop().await;
        orchestrator.failover().shutdown().await;
    }
}
