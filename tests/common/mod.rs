//! Shared collaborators for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use conductor_core::batch::WorkError;
use conductor_core::config::{BatchConfig, ConductorConfig};
use conductor_core::pipeline::{QualityAnnotation, Scorer, ScorerError};
use conductor_core::workers::{FeedError, HealthProbe, WorkerFeed, WorkerStatusReport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("conductor_core=debug")
        .with_test_writer()
        .try_init();
}

/// Retries without real waiting
pub fn fast_batch_config() -> BatchConfig {
    BatchConfig {
        max_concurrent: 4,
        retry_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        circuit_breaker_threshold: 5,
        circuit_breaker_timeout_ms: 60_000,
        default_batch_size: 10,
        history_window: 10,
    }
}

pub fn fast_conductor_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.batch = fast_batch_config();
    config.pipeline.stage_retry_base_delay_ms = 1;
    config.failover.recovery_base_delay_ms = 10;
    config.failover.recovery_max_delay_ms = 50;
    config.failover.breaker_timeout_ms = 10;
    config
}

pub fn records(n: usize) -> Vec<Value> {
    (0..n).map(|i| json!({"id": i, "name": format!("record-{i}")})).collect()
}

/// Worker feed serving whatever the test installed last
#[derive(Default)]
pub struct ScriptedWorkerFeed {
    reports: Mutex<Vec<WorkerStatusReport>>,
    failing: AtomicBool,
    polls: AtomicU32,
}

impl ScriptedWorkerFeed {
    pub fn new(reports: Vec<WorkerStatusReport>) -> Self {
        Self {
            reports: Mutex::new(reports),
            ..Default::default()
        }
    }

    pub fn set_reports(&self, reports: Vec<WorkerStatusReport>) {
        *self.reports.lock() = reports;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerFeed for ScriptedWorkerFeed {
    async fn poll(&self) -> Result<Vec<WorkerStatusReport>, FeedError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(FeedError::Unavailable("scripted outage".to_string()));
        }
        Ok(self.reports.lock().clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Probe answering from a script, passing once the script runs out
#[derive(Default)]
pub struct ScriptedProbe {
    outcomes: Mutex<VecDeque<bool>>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(outcomes: impl IntoIterator<Item = bool>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, worker_id: &str) -> Result<(), FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcomes.lock().pop_front() {
            Some(false) => Err(FeedError::ProbeFailed {
                worker_id: worker_id.to_string(),
                reason: "scripted failure".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Unit of work that fails the first `failures_per_item` attempts of each item
pub struct FlakyUnitOfWork {
    failures_per_item: u32,
    attempts: Mutex<HashMap<usize, u32>>,
    calls: AtomicU32,
}

impl FlakyUnitOfWork {
    pub fn new(failures_per_item: u32) -> Self {
        Self {
            failures_per_item,
            attempts: Mutex::new(HashMap::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub async fn call(&self, item: usize) -> Result<usize, WorkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let entry = attempts.entry(item).or_insert(0);
            *entry += 1;
            *entry
        };
        tokio::task::yield_now().await;
        if attempt <= self.failures_per_item {
            Err(WorkError::retryable(format!("item {item} attempt {attempt} flaked")))
        } else {
            Ok(item * 2)
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Records the peak number of concurrent invocations
#[derive(Default)]
pub struct InFlightTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightTracker {
    pub async fn run(&self, hold: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct FailingScorer {
    calls: AtomicU32,
}

impl FailingScorer {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scorer for FailingScorer {
    async fn score(&self, _record: &Value) -> Result<Option<QualityAnnotation>, ScorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ScorerError::Unavailable("model endpoint down".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Scorer that stalls while switched to slow, annotating otherwise
#[derive(Debug, Default)]
pub struct StallingScorer {
    slow: AtomicBool,
}

impl StallingScorer {
    pub fn stalled() -> Self {
        Self {
            slow: AtomicBool::new(true),
        }
    }

    pub fn set_slow(&self, slow: bool) {
        self.slow.store(slow, Ordering::SeqCst);
    }
}

#[async_trait]
impl Scorer for StallingScorer {
    async fn score(&self, record: &Value) -> Result<Option<QualityAnnotation>, ScorerError> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let anomalous = record.get("id").and_then(Value::as_u64) == Some(0);
        Ok(Some(QualityAnnotation {
            quality_score: if anomalous { 0.2 } else { 0.9 },
            is_anomaly: anomalous,
            recommendation: if anomalous { "review" } else { "accept" }.to_string(),
        }))
    }

    fn name(&self) -> &str {
        "stalling"
    }
}
