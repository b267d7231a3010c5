//! Job bookkeeping: handles, per-stage progress and the status watch.

use crate::batch::ProcessingState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Opaque reference to a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
}

impl JobHandle {
    pub(crate) fn new() -> Self {
        Self {
            job_id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Fixed stage order of every job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Process,
    Aggregate,
    Validate,
    Score,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Process,
        PipelineStage::Aggregate,
        PipelineStage::Validate,
        PipelineStage::Score,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Aggregate => "aggregate",
            Self::Validate => "validate",
            Self::Score => "score",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: PipelineStage,
    pub state: StageState,
    /// Attempts made across every run of the job, resumes included
    pub attempts: u32,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StageProgress {
    fn pending(stage: PipelineStage) -> Self {
        Self {
            stage,
            state: StageState::Pending,
            attempts: 0,
            error: None,
            duration_ms: 0,
        }
    }
}

/// Item tallies after the process stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Queryable view of a job; replaced wholesale through the status watch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub state: JobState,
    pub stages: Vec<StageProgress>,
    pub items: ItemCounts,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Times the job was resumed after failing or being cancelled
    pub resumes: u32,
}

impl JobStatus {
    pub(crate) fn queued(handle: JobHandle, total_items: usize) -> Self {
        Self {
            job_id: handle.job_id,
            state: JobState::Queued,
            stages: PipelineStage::ALL
                .iter()
                .map(|stage| StageProgress::pending(*stage))
                .collect(),
            items: ItemCounts {
                total: total_items,
                ..Default::default()
            },
            error: None,
            submitted_at: Utc::now(),
            finished_at: None,
            resumes: 0,
        }
    }

    pub fn stage(&self, stage: PipelineStage) -> Option<&StageProgress> {
        self.stages.iter().find(|progress| progress.stage == stage)
    }

    pub(crate) fn stage_mut(&mut self, stage: PipelineStage) -> Option<&mut StageProgress> {
        self.stages.iter_mut().find(|progress| progress.stage == stage)
    }

    /// First stage that has not completed, in pipeline order
    pub fn first_incomplete_stage(&self) -> Option<PipelineStage> {
        self.stages
            .iter()
            .find(|progress| progress.state != StageState::Completed)
            .map(|progress| progress.stage)
    }

    pub(crate) fn finish(&mut self, state: JobState, error: Option<String>) {
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

/// Outcome of one input record after the process stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Position in the submitted item list
    pub index: usize,
    pub state: ProcessingState,
    pub record: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub cache_hit: bool,
    pub retry_count: u32,
    pub duration: Duration,
}

impl ItemOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == ProcessingState::Completed
    }
}

/// Merged figures across every sub-batch of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub cancelled_items: usize,
    pub success_rate: f64,
    pub cache_hits: usize,
    /// Cache hits over total items
    pub cache_hit_rate: f64,
    pub sub_batches: usize,
    pub workers_used: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid_items: usize,
    /// Indexes of records dropped for missing required fields
    pub dropped: Vec<usize>,
}

/// Final product of a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub job_id: Uuid,
    /// Validated records in input order, annotated where the scorer answered
    pub records: Vec<Value>,
    pub outcomes: Vec<ItemOutcome>,
    pub aggregate: AggregateReport,
    pub validation: ValidationReport,
    pub annotated_items: usize,
    pub anomalies: usize,
}
