//! # Distributed Task Pipeline
//!
//! Runs submitted jobs through a fixed chain of stages:
//!
//! ```text
//! process (worker-routed sub-batches) -> aggregate -> validate -> score
//! ```
//!
//! ## Key Features
//!
//! - **Worker routing**: items are split into sub-batches of roughly
//!   `batch_size`; each sub-batch is routed independently through the
//!   [`LoadBalancer`] and executed by the shared [`AdaptiveBatchProcessor`].
//! - **Stage retry**: every stage is retried on its own with backoff; a failed
//!   stage leaves completed upstream outputs in place so [`resume`] continues
//!   from the first incomplete stage.
//! - **Result cache**: with a cache key field configured, finished records are
//!   stored in the [`TieredCache`] and served from it on later submissions.
//! - **Failover routing**: a [`WorkError::WorkerFailure`] fails the item and is
//!   reported to the [`FailoverController`]; retries move to another worker
//!   once the failing one stops being routable.
//! - **Cancellation**: best-effort. Items not yet started end `Cancelled`;
//!   in-flight handler calls finish and keep their result.
//! - **Retention**: finished jobs stay queryable until [`remove_job`] drops
//!   them or [`prune_finished`] ages them out.
//!
//! [`resume`]: DistributedPipeline::resume
//! [`remove_job`]: DistributedPipeline::remove_job
//! [`prune_finished`]: DistributedPipeline::prune_finished

pub mod handler;
pub mod job;
pub mod scorer;
pub mod stages;

pub use handler::{FnWorkHandler, PassThroughHandler, WorkHandler};
pub use job::{
    AggregateReport, ItemCounts, ItemOutcome, JobHandle, JobOutput, JobState, JobStatus,
    PipelineStage, StageProgress, StageState, ValidationReport,
};
pub use scorer::{NullScorer, QualityAnnotation, Scorer, ScorerError};
pub use stages::{ScoredRecords, StageConfig};

use crate::balancer::LoadBalancer;
use crate::batch::{AdaptiveBatchProcessor, ProcessingResult, ProcessingState, WorkError};
use crate::cache::TieredCache;
use crate::config::PipelineConfig;
use crate::error::{ConductorError, Result};
use crate::failover::FailoverController;
use crate::resilience::ExponentialBackoff;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use stages::ResolvedStageConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Cap on the delay between stage attempts
const STAGE_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct ProcessOutput {
    outcomes: Vec<ItemOutcome>,
    sub_batches: usize,
}

/// Completed stage outputs, kept so a resumed job skips finished stages
#[derive(Debug, Default)]
struct StageOutputs {
    processed: Option<ProcessOutput>,
    aggregate: Option<AggregateReport>,
    validated: Option<(Vec<Value>, ValidationReport)>,
    scored: Option<ScoredRecords>,
}

struct JobEntry {
    handle: JobHandle,
    config: StageConfig,
    input: Arc<Vec<Value>>,
    status: watch::Sender<JobStatus>,
    outputs: Mutex<StageOutputs>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobEntry {
    fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    fn update_stage(&self, stage: PipelineStage, update: impl FnOnce(&mut StageProgress)) {
        self.status.send_modify(|status| {
            if let Some(progress) = status.stage_mut(stage) {
                update(progress);
            }
        });
    }
}

/// Per-sub-batch context shared by every item task of that sub-batch
struct ItemContext {
    assigned_worker: String,
    stage_config: ResolvedStageConfig,
    handler: Arc<dyn WorkHandler>,
    cache: Arc<TieredCache>,
    balancer: Arc<LoadBalancer>,
    failover: FailoverController,
}

/// What the unit of work hands back for one record
#[derive(Debug, Clone)]
struct ItemOutput {
    record: Value,
    worker_id: Option<String>,
    cache_hit: bool,
}

impl ItemContext {
    /// The assigned worker while it stays routable, otherwise a fresh pick
    fn current_worker(&self) -> std::result::Result<String, WorkError> {
        if self.failover.registry().is_routable(&self.assigned_worker) {
            return Ok(self.assigned_worker.clone());
        }
        self.balancer
            .select_worker(&self.stage_config.task_type, self.stage_config.priority)
            .ok_or_else(|| {
                WorkError::fatal(
                    ConductorError::NoCapacity {
                        task_type: self.stage_config.task_type.clone(),
                    }
                    .to_string(),
                )
            })
    }

    async fn execute(&self, record: Value) -> std::result::Result<ItemOutput, WorkError> {
        let cache_key = self.stage_config.cache_key(&record);
        if let Some(key) = cache_key.as_deref() {
            if let Some(cached) = self.cache.get::<Value>(key).await {
                return Ok(ItemOutput {
                    record: cached,
                    worker_id: None,
                    cache_hit: true,
                });
            }
        }

        let worker_id = self.current_worker()?;
        let registry = self.failover.registry();
        if registry.record_task_started(&worker_id).is_err() {
            return Err(WorkError::fatal(format!(
                "worker {worker_id} deregistered before the task started"
            )));
        }

        let started = Instant::now();
        let result = self.handler.handle(&worker_id, record).await;
        if let Err(e) = registry.record_task_completion(&worker_id, result.is_ok(), started.elapsed()) {
            debug!(worker_id = %worker_id, error = %e, "Completion callback skipped");
        }

        match &result {
            Ok(_) => {
                if let Err(e) = self.failover.record_success(&worker_id) {
                    debug!(worker_id = %worker_id, error = %e, "Success report skipped");
                }
            }
            Err(WorkError::WorkerFailure { reason, .. }) => {
                warn!(worker_id = %worker_id, reason = %reason, "⚠️ PIPELINE: Worker failure routed to failover");
                if let Err(e) = self.failover.record_failure(&worker_id) {
                    debug!(worker_id = %worker_id, error = %e, "Failover report skipped");
                }
            }
            Err(_) => {}
        }

        let output = result?;
        if let Some(key) = cache_key.as_deref() {
            self.cache.set(key, &output, self.stage_config.cache_ttl).await;
        }
        Ok(ItemOutput {
            record: output,
            worker_id: Some(worker_id),
            cache_hit: false,
        })
    }
}

struct PipelineInner {
    balancer: Arc<LoadBalancer>,
    failover: FailoverController,
    processor: Arc<AdaptiveBatchProcessor>,
    cache: Arc<TieredCache>,
    handler: Arc<dyn WorkHandler>,
    scorer: Arc<dyn Scorer>,
    config: PipelineConfig,
    jobs: DashMap<Uuid, Arc<JobEntry>>,
    /// Replaced by `reopen` after a shutdown
    shutdown: Mutex<CancellationToken>,
}

/// Multi-stage job runner; clones share the job table
#[derive(Clone)]
pub struct DistributedPipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for DistributedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedPipeline")
            .field("config", &self.inner.config)
            .field("handler", &self.inner.handler.name())
            .field("scorer", &self.inner.scorer.name())
            .field("jobs", &self.inner.jobs.len())
            .finish()
    }
}

impl DistributedPipeline {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        failover: FailoverController,
        processor: Arc<AdaptiveBatchProcessor>,
        cache: Arc<TieredCache>,
        handler: Arc<dyn WorkHandler>,
        scorer: Arc<dyn Scorer>,
        config: PipelineConfig,
    ) -> Self {
        info!(
            handler = handler.name(),
            scorer = scorer.name(),
            default_batch_size = config.default_batch_size,
            "🧩 PIPELINE: Initialized"
        );
        Self {
            inner: Arc::new(PipelineInner {
                balancer,
                failover,
                processor,
                cache,
                handler,
                scorer,
                config,
                jobs: DashMap::new(),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Queue a job and start it in the background
    #[instrument(skip(self, items, config), fields(items = items.len()))]
    pub fn submit(&self, items: Vec<Value>, config: StageConfig) -> Result<JobHandle> {
        if self.is_shut_down() {
            return Err(ConductorError::InvalidState(
                "pipeline is shut down".to_string(),
            ));
        }

        let handle = JobHandle::new();
        let (status, _) = watch::channel(JobStatus::queued(handle, items.len()));
        let entry = Arc::new(JobEntry {
            handle,
            config,
            input: Arc::new(items),
            status,
            outputs: Mutex::new(StageOutputs::default()),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        });

        self.inner.jobs.insert(handle.job_id, Arc::clone(&entry));
        info!(job_id = %handle, items = entry.input.len(), "📋 PIPELINE: Job submitted");
        self.launch(entry);
        Ok(handle)
    }

    pub fn job_status(&self, handle: &JobHandle) -> Result<JobStatus> {
        Ok(self.entry(handle)?.status())
    }

    /// Final records of a completed job; `None` until the job completes
    pub fn job_output(&self, handle: &JobHandle) -> Result<Option<JobOutput>> {
        let entry = self.entry(handle)?;
        if entry.status().state != JobState::Completed {
            return Ok(None);
        }

        let outputs = entry.outputs.lock();
        let (Some(processed), Some(aggregate), Some((_, validation)), Some(scored)) = (
            outputs.processed.as_ref(),
            outputs.aggregate.as_ref(),
            outputs.validated.as_ref(),
            outputs.scored.as_ref(),
        ) else {
            return Err(ConductorError::InvalidState(format!(
                "job {handle} completed without every stage output"
            )));
        };

        Ok(Some(JobOutput {
            job_id: handle.job_id,
            records: scored.records.clone(),
            outcomes: processed.outcomes.clone(),
            aggregate: aggregate.clone(),
            validation: validation.clone(),
            annotated_items: scored.annotated,
            anomalies: scored.anomalies,
        }))
    }

    /// Block until the job reaches a terminal state or `timeout` elapses
    pub async fn wait(&self, handle: &JobHandle, timeout: Duration) -> Result<JobStatus> {
        let entry = self.entry(handle)?;
        let mut receiver = entry.status.subscribe();

        let waited = tokio::time::timeout(
            timeout,
            receiver.wait_for(|status| status.state.is_terminal()),
        )
        .await
        .map(|result| result.map(|status| JobStatus::clone(&status)));

        match waited {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(ConductorError::Internal(format!(
                "status channel for job {handle} closed"
            ))),
            Err(_) => Err(ConductorError::Timeout {
                operation: format!("job {handle}"),
                timeout,
            }),
        }
    }

    /// Signal cancellation; returns false if the job had already finished
    pub fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let entry = self.entry(handle)?;
        if entry.status().state.is_terminal() {
            return Ok(false);
        }
        entry.cancel.lock().cancel();
        info!(job_id = %handle, "🛑 PIPELINE: Cancellation requested");
        Ok(true)
    }

    /// Restart a failed or cancelled job from its first incomplete stage
    pub fn resume(&self, handle: &JobHandle) -> Result<()> {
        let entry = self.entry(handle)?;
        let state = entry.status().state;
        if !matches!(state, JobState::Failed | JobState::Cancelled) {
            return Err(ConductorError::InvalidState(format!(
                "job {handle} is {state:?}; only failed or cancelled jobs can resume"
            )));
        }

        entry.status.send_modify(|status| {
            status.state = JobState::Queued;
            status.error = None;
            status.finished_at = None;
            status.resumes += 1;
            for progress in status
                .stages
                .iter_mut()
                .filter(|p| p.state != StageState::Completed)
            {
                progress.state = StageState::Pending;
                progress.error = None;
            }
        });

        info!(job_id = %handle, "🔁 PIPELINE: Job resumed");
        self.launch(entry);
        Ok(())
    }

    /// Ids of jobs that have not reached a terminal state
    pub fn active_jobs(&self) -> Vec<JobHandle> {
        self.inner
            .jobs
            .iter()
            .filter(|entry| !entry.status().state.is_terminal())
            .map(|entry| entry.handle)
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Drop a finished job and its stored outputs; running jobs are refused
    pub fn remove_job(&self, handle: &JobHandle) -> Result<JobStatus> {
        let entry = self.entry(handle)?;
        let status = entry.status();
        if !status.state.is_terminal() {
            return Err(ConductorError::InvalidState(format!(
                "job {handle} is {:?}; only finished jobs can be removed",
                status.state
            )));
        }
        self.inner.jobs.remove(&handle.job_id);
        debug!(job_id = %handle, "🗑️ PIPELINE: Job removed");
        Ok(status)
    }

    /// Remove terminal jobs that finished more than `retention` ago
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };

        let before = self.inner.jobs.len();
        self.inner.jobs.retain(|_, entry| {
            let status = entry.status.borrow();
            !(status.state.is_terminal() && status.finished_at.is_some_and(|at| at <= cutoff))
        });
        let pruned = before.saturating_sub(self.inner.jobs.len());
        if pruned > 0 {
            info!(pruned, "🧹 PIPELINE: Pruned finished jobs");
        }
        pruned
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.lock().is_cancelled()
    }

    /// Accept submissions again after `shutdown`; no-op while running
    pub fn reopen(&self) {
        let mut shutdown = self.inner.shutdown.lock();
        if shutdown.is_cancelled() {
            *shutdown = CancellationToken::new();
            info!("🔄 PIPELINE: Reopened");
        }
    }

    /// Cancel every job and join their tasks
    pub async fn shutdown(&self) {
        self.inner.shutdown.lock().cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .jobs
            .iter()
            .filter_map(|entry| entry.task.lock().take())
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Pipeline job task ended abnormally");
            }
        }
        info!("🛑 PIPELINE: Shut down");
    }

    fn entry(&self, handle: &JobHandle) -> Result<Arc<JobEntry>> {
        self.inner
            .jobs
            .get(&handle.job_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ConductorError::JobNotFound {
                job_id: handle.job_id,
            })
    }

    fn launch(&self, entry: Arc<JobEntry>) {
        let cancel = self.inner.shutdown.lock().child_token();
        *entry.cancel.lock() = cancel.clone();
        let task = tokio::spawn(drive_job(Arc::clone(&self.inner), Arc::clone(&entry), cancel));
        *entry.task.lock() = Some(task);
    }
}

async fn drive_job(inner: Arc<PipelineInner>, entry: Arc<JobEntry>, cancel: CancellationToken) {
    let job_id = entry.handle;
    let stage_config = entry
        .config
        .resolve(&inner.config, inner.processor.recommended_batch_size());
    let Some(first) = entry.status().first_incomplete_stage() else {
        entry
            .status
            .send_modify(|status| status.finish(JobState::Completed, None));
        return;
    };

    entry.status.send_modify(|status| status.state = JobState::Running);
    info!(
        job_id = %job_id,
        first_stage = %first,
        batch_size = stage_config.batch_size,
        task_type = %stage_config.task_type,
        "🚀 PIPELINE: Job running"
    );

    for stage in PipelineStage::ALL.into_iter().skip_while(|stage| *stage != first) {
        if cancel.is_cancelled() {
            entry.update_stage(stage, |progress| progress.state = StageState::Cancelled);
            entry
                .status
                .send_modify(|status| status.finish(JobState::Cancelled, None));
            info!(job_id = %job_id, stage = %stage, "🛑 PIPELINE: Job cancelled");
            return;
        }

        match inner.run_stage(&entry, stage, &stage_config, &cancel).await {
            Ok(()) => {}
            Err(ConductorError::Cancelled(reason)) => {
                entry.update_stage(stage, |progress| progress.state = StageState::Cancelled);
                entry
                    .status
                    .send_modify(|status| status.finish(JobState::Cancelled, Some(reason)));
                info!(job_id = %job_id, stage = %stage, "🛑 PIPELINE: Job cancelled");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, stage = %stage, error = %e, "❌ PIPELINE: Job failed");
                entry
                    .status
                    .send_modify(|status| status.finish(JobState::Failed, Some(e.to_string())));
                return;
            }
        }
    }

    entry
        .status
        .send_modify(|status| status.finish(JobState::Completed, None));
    let items = entry.status().items;
    info!(
        job_id = %job_id,
        succeeded = items.succeeded,
        failed = items.failed,
        "✅ PIPELINE: Job completed"
    );
}

impl PipelineInner {
    /// One stage with its own retry budget
    async fn run_stage(
        &self,
        entry: &JobEntry,
        stage: PipelineStage,
        stage_config: &ResolvedStageConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let max_attempts = self.config.stage_retry_attempts.max(1);
        let backoff =
            ExponentialBackoff::new(self.config.stage_retry_base_delay(), STAGE_RETRY_MAX_DELAY);
        let started = Instant::now();

        let result = backoff
            .retry(
                max_attempts,
                |e: &ConductorError| !matches!(e, ConductorError::Cancelled(_)),
                |attempt| {
                    entry.update_stage(stage, |progress| {
                        progress.state = StageState::Running;
                        progress.attempts += 1;
                    });
                    debug!(job_id = %entry.handle, stage = %stage, attempt, "Stage attempt");
                    self.attempt_stage(entry, stage, stage_config, cancel)
                },
            )
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                entry.update_stage(stage, |progress| {
                    progress.state = StageState::Completed;
                    progress.error = None;
                    progress.duration_ms = duration_ms;
                });
                debug!(job_id = %entry.handle, stage = %stage, duration_ms, "Stage completed");
                Ok(())
            }
            Err(ConductorError::Cancelled(reason)) => Err(ConductorError::Cancelled(reason)),
            Err(e) => {
                let reason = e.to_string();
                entry.update_stage(stage, |progress| {
                    progress.state = StageState::Failed;
                    progress.error = Some(reason.clone());
                    progress.duration_ms = duration_ms;
                });
                Err(ConductorError::StageFailed {
                    stage: stage.to_string(),
                    attempts: max_attempts,
                    reason,
                })
            }
        }
    }

    async fn attempt_stage(
        &self,
        entry: &JobEntry,
        stage: PipelineStage,
        stage_config: &ResolvedStageConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let work = async {
            match stage {
                PipelineStage::Process => self.process_stage(entry, stage_config, cancel).await,
                PipelineStage::Aggregate => self.aggregate_stage(entry),
                PipelineStage::Validate => self.validate_stage(entry, stage_config),
                PipelineStage::Score => self.score_stage(entry).await,
            }
        };

        match stage_config.stage_timeout {
            Some(timeout) => tokio::time::timeout(timeout, work).await.map_err(|_| {
                ConductorError::Timeout {
                    operation: format!("{stage} stage"),
                    timeout,
                }
            })?,
            None => work.await,
        }
    }

    /// Run every item not yet processed; a resumed job only reruns cancelled items
    async fn process_stage(
        &self,
        entry: &JobEntry,
        stage_config: &ResolvedStageConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let prior = entry.outputs.lock().processed.clone();
        let pending: Vec<usize> = match &prior {
            Some(prior) => prior
                .outcomes
                .iter()
                .filter(|o| o.state == ProcessingState::Cancelled)
                .map(|o| o.index)
                .collect(),
            None => (0..entry.input.len()).collect(),
        };

        let fresh = self
            .process_items(&entry.input, &pending, stage_config, cancel)
            .await;

        let merged = match prior {
            Some(mut prior) => {
                prior.sub_batches += fresh.sub_batches;
                for outcome in fresh.outcomes {
                    if let Some(slot) = prior.outcomes.get_mut(outcome.index) {
                        *slot = outcome;
                    }
                }
                prior
            }
            None => fresh,
        };

        let counts = item_counts(&merged.outcomes);
        let cancelled = counts.cancelled;
        entry.status.send_modify(|status| status.items = counts);
        entry.outputs.lock().processed = Some(merged);

        if cancelled > 0 && cancel.is_cancelled() {
            return Err(ConductorError::Cancelled(format!(
                "{cancelled} item(s) not started"
            )));
        }
        Ok(())
    }

    /// Fan the indexed items out into independently routed sub-batches
    async fn process_items(
        &self,
        input: &Arc<Vec<Value>>,
        indices: &[usize],
        stage_config: &ResolvedStageConfig,
        cancel: &CancellationToken,
    ) -> ProcessOutput {
        let sub_batches: Vec<&[usize]> = indices.chunks(stage_config.batch_size).collect();
        let count = sub_batches.len();

        let outcomes = join_all(
            sub_batches
                .into_iter()
                .map(|batch| self.run_sub_batch(input, batch, stage_config, cancel)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        ProcessOutput {
            outcomes,
            sub_batches: count,
        }
    }

    async fn run_sub_batch(
        &self,
        input: &Arc<Vec<Value>>,
        indices: &[usize],
        stage_config: &ResolvedStageConfig,
        cancel: &CancellationToken,
    ) -> Vec<ItemOutcome> {
        if cancel.is_cancelled() {
            return indices
                .iter()
                .map(|index| outcome_from(*index, None, ProcessingResult::cancelled()))
                .collect();
        }

        let Some(worker_id) = self
            .balancer
            .select_worker(&stage_config.task_type, stage_config.priority)
        else {
            warn!(
                task_type = %stage_config.task_type,
                items = indices.len(),
                "⚠️ PIPELINE: No worker capacity for sub-batch"
            );
            return self.serve_without_capacity(input, indices, stage_config).await;
        };

        let context = Arc::new(ItemContext {
            assigned_worker: worker_id.clone(),
            stage_config: stage_config.clone(),
            handler: Arc::clone(&self.handler),
            cache: Arc::clone(&self.cache),
            balancer: Arc::clone(&self.balancer),
            failover: self.failover.clone(),
        });
        let records: Vec<Value> = indices.iter().map(|index| input[*index].clone()).collect();

        debug!(worker_id = %worker_id, items = records.len(), "Sub-batch routed");
        let batch = self
            .processor
            .process_batch_cancellable(
                records,
                move |record: Value| {
                    let context = Arc::clone(&context);
                    async move { context.execute(record).await }
                },
                Some(indices.len()),
                cancel,
            )
            .await;

        batch
            .into_results()
            .into_iter()
            .zip(indices)
            .map(|(result, index)| outcome_from(*index, Some(worker_id.as_str()), result))
            .collect()
    }

    /// Cached records still complete; everything else fails with no capacity
    async fn serve_without_capacity(
        &self,
        input: &Arc<Vec<Value>>,
        indices: &[usize],
        stage_config: &ResolvedStageConfig,
    ) -> Vec<ItemOutcome> {
        let error = ConductorError::NoCapacity {
            task_type: stage_config.task_type.clone(),
        };

        let mut outcomes = Vec::with_capacity(indices.len());
        for index in indices {
            let cached = match stage_config.cache_key(&input[*index]) {
                Some(key) => self.cache.get::<Value>(&key).await,
                None => None,
            };
            let result = match cached {
                Some(record) => ProcessingResult::completed(
                    ItemOutput {
                        record,
                        worker_id: None,
                        cache_hit: true,
                    },
                    Duration::ZERO,
                    0,
                ),
                None => {
                    ProcessingResult::failed(WorkError::fatal(error.to_string()), Duration::ZERO, 0)
                }
            };
            outcomes.push(outcome_from(*index, None, result));
        }
        outcomes
    }

    fn aggregate_stage(&self, entry: &JobEntry) -> Result<()> {
        let mut outputs = entry.outputs.lock();
        let processed = outputs
            .processed
            .as_ref()
            .ok_or_else(|| missing_output(entry, PipelineStage::Process))?;
        let report = stages::aggregate(&processed.outcomes, processed.sub_batches);
        debug!(
            job_id = %entry.handle,
            success_rate = report.success_rate,
            cache_hit_rate = report.cache_hit_rate,
            "Aggregated sub-batches"
        );
        outputs.aggregate = Some(report);
        Ok(())
    }

    fn validate_stage(&self, entry: &JobEntry, stage_config: &ResolvedStageConfig) -> Result<()> {
        let mut outputs = entry.outputs.lock();
        let processed = outputs
            .processed
            .as_ref()
            .ok_or_else(|| missing_output(entry, PipelineStage::Process))?;
        let (records, report) = stages::validate(&processed.outcomes, &stage_config.required_fields);
        if !report.dropped.is_empty() {
            info!(
                job_id = %entry.handle,
                dropped = report.dropped.len(),
                "Validation dropped records missing required fields"
            );
        }
        outputs.validated = Some((records, report));
        Ok(())
    }

    async fn score_stage(&self, entry: &JobEntry) -> Result<()> {
        let records = entry
            .outputs
            .lock()
            .validated
            .as_ref()
            .map(|(records, _)| records.clone())
            .ok_or_else(|| missing_output(entry, PipelineStage::Validate))?;

        let scored = stages::score(records, self.scorer.as_ref()).await;
        entry.outputs.lock().scored = Some(scored);
        Ok(())
    }
}

fn outcome_from(
    index: usize,
    assigned_worker: Option<&str>,
    result: ProcessingResult<ItemOutput>,
) -> ItemOutcome {
    let (record, worker_id, cache_hit) = match result.data {
        Some(output) => (Some(output.record), output.worker_id, output.cache_hit),
        None if result.state == ProcessingState::Failed => {
            (None, assigned_worker.map(str::to_string), false)
        }
        None => (None, None, false),
    };

    ItemOutcome {
        index,
        state: result.state,
        record,
        error: result.error,
        worker_id,
        cache_hit,
        retry_count: result.retry_count,
        duration: result.duration,
    }
}

fn item_counts(outcomes: &[ItemOutcome]) -> ItemCounts {
    let mut counts = ItemCounts {
        total: outcomes.len(),
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome.state {
            ProcessingState::Completed => counts.succeeded += 1,
            ProcessingState::Cancelled => counts.cancelled += 1,
            _ => counts.failed += 1,
        }
    }
    counts
}

fn missing_output(entry: &JobEntry, stage: PipelineStage) -> ConductorError {
    ConductorError::InvalidState(format!(
        "job {} has no {stage} output",
        entry.handle
    ))
}
