//! End-to-end pipeline jobs driven through the orchestrator

mod common;

use common::{
    fast_conductor_config, init_test_logging, records, FailingScorer, ScriptedProbe,
    StallingScorer,
};
use conductor_core::batch::WorkError;
use conductor_core::pipeline::{FnWorkHandler, JobState, PipelineStage, StageConfig, StageState};
use conductor_core::{ConductorError, SmartOrchestrator};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const WAIT: Duration = Duration::from_secs(10);

async fn orchestrator_with_workers(
    builder: conductor_core::SmartOrchestratorBuilder,
    workers: &[&str],
) -> SmartOrchestrator {
    let orchestrator = builder.build().await.unwrap();
    for id in workers {
        orchestrator.register_worker(id, HashMap::new());
    }
    orchestrator
}

#[tokio::test]
async fn test_job_runs_every_stage_across_workers() {
    init_test_logging();
    info!("🧪 End-to-end job");

    let seen_workers = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let recorder = Arc::clone(&seen_workers);
    let handler = Arc::new(FnWorkHandler::new(move |worker_id: String, mut record: Value| {
        recorder.lock().push(worker_id.clone());
        async move {
            record["processed_by"] = json!(worker_id);
            Ok(record)
        }
    }));
    let orchestrator = orchestrator_with_workers(
        SmartOrchestrator::builder(fast_conductor_config()).with_handler(handler),
        &["w1", "w2", "w3"],
    )
    .await;

    let job = orchestrator
        .submit(records(30), StageConfig::new().with_batch_size(4))
        .unwrap();
    let status = orchestrator.wait_for_job(&job, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.items.total, 30);
    assert_eq!(status.items.succeeded, 30);
    for stage in PipelineStage::ALL {
        assert_eq!(status.stage(stage).unwrap().state, StageState::Completed);
    }

    let output = orchestrator.job_output(&job).unwrap().unwrap();
    assert_eq!(output.records.len(), 30);
    assert_eq!(output.aggregate.sub_batches, 8);
    assert!(!output.aggregate.workers_used.is_empty());
    // Output keeps input order
    for (i, record) in output.records.iter().enumerate() {
        assert_eq!(record["id"], json!(i));
        assert!(record["processed_by"].is_string());
    }
    assert_eq!(seen_workers.lock().len(), 30);

    let status = orchestrator.get_system_status();
    assert_eq!(status.active_jobs, 0);
    assert_eq!(status.workers.iter().map(|w| w.completed_tasks).sum::<u64>(), 30);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_validation_drops_records_missing_required_fields() {
    let handler = Arc::new(FnWorkHandler::new(|_worker: String, record: Value| async move {
        if record["id"].as_u64().unwrap_or(0) % 2 == 0 {
            Ok(json!({"id": record["id"], "name": null}))
        } else {
            Ok(record)
        }
    }));
    let orchestrator = orchestrator_with_workers(
        SmartOrchestrator::builder(fast_conductor_config()).with_handler(handler),
        &["w1"],
    )
    .await;

    let job = orchestrator
        .submit(records(6), StageConfig::new().with_required_fields(["id", "name"]))
        .unwrap();
    orchestrator.wait_for_job(&job, WAIT).await.unwrap();

    let output = orchestrator.job_output(&job).unwrap().unwrap();
    assert_eq!(output.validation.valid_items, 3);
    assert_eq!(output.validation.dropped, vec![0, 2, 4]);
    assert_eq!(output.records.len(), 3);
}

#[tokio::test]
async fn test_failing_scorer_passes_records_through() {
    let scorer = Arc::new(FailingScorer::default());
    let orchestrator = orchestrator_with_workers(
        SmartOrchestrator::builder(fast_conductor_config()).with_scorer(Arc::clone(&scorer) as _),
        &["w1"],
    )
    .await;

    let job = orchestrator.submit(records(5), StageConfig::new()).unwrap();
    let status = orchestrator.wait_for_job(&job, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    let output = orchestrator.job_output(&job).unwrap().unwrap();
    assert_eq!(output.records, records(5));
    assert_eq!(output.annotated_items, 0);
    assert_eq!(scorer.calls(), 5);
}

#[tokio::test]
async fn test_stage_timeout_fails_job_and_resume_finishes_it() {
    init_test_logging();
    let scorer = Arc::new(StallingScorer::stalled());
    let orchestrator = orchestrator_with_workers(
        SmartOrchestrator::builder(fast_conductor_config()).with_scorer(Arc::clone(&scorer) as _),
        &["w1", "w2"],
    )
    .await;

    let job = orchestrator
        .submit(
            records(4),
            StageConfig::new().with_stage_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    let failed = orchestrator.wait_for_job(&job, WAIT).await.unwrap();

    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.error.is_some());
    assert_eq!(failed.stage(PipelineStage::Process).unwrap().state, StageState::Completed);
    let score = failed.stage(PipelineStage::Score).unwrap();
    assert_eq!(score.state, StageState::Failed);
    assert_eq!(score.attempts, 2);
    assert!(orchestrator.job_output(&job).unwrap().is_none());

    scorer.set_slow(false);
    orchestrator.resume_job(&job).unwrap();
    let resumed = orchestrator.wait_for_job(&job, WAIT).await.unwrap();

    assert_eq!(resumed.state, JobState::Completed);
    assert_eq!(resumed.resumes, 1);
    let output = orchestrator.job_output(&job).unwrap().unwrap();
    assert_eq!(output.annotated_items, 4);
    assert_eq!(output.anomalies, 1);
    assert!(output.records.iter().all(|r| r.get("_quality").is_some()));

    // The completed job cannot be resumed again
    assert!(matches!(
        orchestrator.resume_job(&job),
        Err(ConductorError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_cancel_then_resume_reruns_only_unstarted_items() {
    init_test_logging();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let handler = Arc::new(FnWorkHandler::new(move |_worker: String, record: Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(record)
        }
    }));
    let mut config = fast_conductor_config();
    config.batch.max_concurrent = 2;
    let orchestrator = orchestrator_with_workers(
        SmartOrchestrator::builder(config).with_handler(handler),
        &["w1"],
    )
    .await;

    let job = orchestrator
        .submit(records(16), StageConfig::new().with_batch_size(16))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(orchestrator.cancel_job(&job).unwrap());

    let cancelled = orchestrator.wait_for_job(&job, WAIT).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.items.cancelled > 0);
    assert_eq!(cancelled.items.succeeded + cancelled.items.cancelled, 16);
    let first_run_calls = calls.load(Ordering::SeqCst);
    assert!(first_run_calls < 16);

    orchestrator.resume_job(&job).unwrap();
    let finished = orchestrator.wait_for_job(&job, WAIT).await.unwrap();

    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(finished.items.succeeded, 16);
    assert_eq!(finished.items.cancelled, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 16);
    assert_eq!(orchestrator.job_output(&job).unwrap().unwrap().records, records(16));
    assert!(!orchestrator.cancel_job(&job).unwrap());
}

#[tokio::test]
async fn test_worker_failures_reroute_to_healthy_workers() {
    init_test_logging();
    let handler = Arc::new(FnWorkHandler::new(|worker_id: String, record: Value| async move {
        if worker_id == "broken" {
            Err(WorkError::WorkerFailure {
                worker_id,
                reason: "process crashed".to_string(),
            })
        } else {
            Ok(record)
        }
    }));
    let mut config = fast_conductor_config();
    config.batch.retry_attempts = 5;
    let orchestrator = orchestrator_with_workers(
        SmartOrchestrator::builder(config)
            .with_handler(handler)
            .with_health_probe(Arc::new(ScriptedProbe::new([false; 100])))
            .with_strategy(Box::new(conductor_core::balancer::LeastConnections)),
        &["broken", "healthy"],
    )
    .await;

    let job = orchestrator
        .submit(records(1), StageConfig::new().with_batch_size(1))
        .unwrap();
    let status = orchestrator.wait_for_job(&job, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.items.succeeded, 1);
    let output = orchestrator.job_output(&job).unwrap().unwrap();
    assert_eq!(output.outcomes[0].worker_id.as_deref(), Some("healthy"));
    assert!(output.outcomes[0].retry_count >= 1);
    let system = orchestrator.get_system_status();
    assert!(system.is_breaker_open("broken"));
    assert_eq!(system.pending_recoveries, vec!["broken".to_string()]);
    orchestrator.failover().shutdown().await;
}

#[tokio::test]
async fn test_wait_times_out_on_slow_job() {
    let handler = Arc::new(FnWorkHandler::new(|_worker: String, record: Value| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(record)
    }));
    let orchestrator = orchestrator_with_workers(
        SmartOrchestrator::builder(fast_conductor_config()).with_handler(handler),
        &["w1"],
    )
    .await;

    let job = orchestrator.submit(records(1), StageConfig::new()).unwrap();
    let result = orchestrator.wait_for_job(&job, Duration::from_millis(50)).await;

    assert!(matches!(result, Err(ConductorError::Timeout { .. })));
    assert_eq!(orchestrator.pipeline().active_jobs(), vec![job]);
    orchestrator.pipeline().shutdown().await;
    assert!(orchestrator.job_status(&job).unwrap().state.is_terminal());
}
