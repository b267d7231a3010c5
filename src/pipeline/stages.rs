//! Per-job stage configuration and the post-processing stages.
//!
//! Aggregation and validation are pure functions over the process-stage
//! outcomes; scoring consults the external scorer record by record.

use super::job::{AggregateReport, ItemOutcome, ValidationReport};
use super::scorer::Scorer;
use crate::config::PipelineConfig;
use crate::constants::cache_keys::{RESULT_NAMESPACE, SEPARATOR};
use crate::constants::selection::NEUTRAL_PRIORITY;
use crate::constants::QUALITY_ANNOTATION_KEY;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Records scored concurrently; `buffered` keeps input order
const SCORE_CONCURRENCY: usize = 8;

/// Knobs for one submitted job; unset fields fall back to [`PipelineConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    pub task_type: Option<String>,
    /// 0-10, 5 is neutral
    pub priority: u8,
    /// Items per worker-routed sub-batch
    pub batch_size: Option<usize>,
    /// Use the processor's throughput-based recommendation when `batch_size` is unset
    pub adaptive_batch_size: bool,
    pub required_fields: Option<Vec<String>>,
    /// Record field whose value keys the per-item result cache
    pub cache_key_field: Option<String>,
    pub cache_ttl: Option<Duration>,
    /// Bound on a single attempt of any stage
    pub stage_timeout: Option<Duration>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            task_type: None,
            priority: NEUTRAL_PRIORITY,
            batch_size: None,
            adaptive_batch_size: false,
            required_fields: None,
            cache_key_field: None,
            cache_ttl: None,
            stage_timeout: None,
        }
    }
}

impl StageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_adaptive_batch_size(mut self) -> Self {
        self.adaptive_batch_size = true;
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_cache_key_field(mut self, field: impl Into<String>) -> Self {
        self.cache_key_field = Some(field.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub(crate) fn resolve(&self, defaults: &PipelineConfig, recommended: usize) -> ResolvedStageConfig {
        let batch_size = self
            .batch_size
            .filter(|size| *size > 0)
            .or_else(|| self.adaptive_batch_size.then_some(recommended))
            .unwrap_or(defaults.default_batch_size)
            .max(1);

        ResolvedStageConfig {
            task_type: self
                .task_type
                .clone()
                .unwrap_or_else(|| defaults.default_task_type.clone()),
            priority: self.priority.min(10),
            batch_size,
            required_fields: self
                .required_fields
                .clone()
                .unwrap_or_else(|| defaults.required_fields.clone()),
            cache_key_field: self.cache_key_field.clone(),
            cache_ttl: self.cache_ttl,
            stage_timeout: self.stage_timeout,
        }
    }
}

/// Stage configuration with every default applied
#[derive(Debug, Clone)]
pub(crate) struct ResolvedStageConfig {
    pub task_type: String,
    pub priority: u8,
    pub batch_size: usize,
    pub required_fields: Vec<String>,
    pub cache_key_field: Option<String>,
    pub cache_ttl: Option<Duration>,
    pub stage_timeout: Option<Duration>,
}

impl ResolvedStageConfig {
    pub fn cache_key(&self, record: &Value) -> Option<String> {
        let field = self.cache_key_field.as_deref()?;
        result_cache_key(&self.task_type, field, record)
    }
}

/// `result:{task_type}:{field value}`, or None when the record lacks the field
pub fn result_cache_key(task_type: &str, field: &str, record: &Value) -> Option<String> {
    let value = match record.get(field)? {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some([RESULT_NAMESPACE, task_type, value.as_str()].join(SEPARATOR))
}

/// Merge sub-batch outcomes into job-wide rates
pub fn aggregate(outcomes: &[ItemOutcome], sub_batches: usize) -> AggregateReport {
    let total_items = outcomes.len();
    let successful_items = outcomes.iter().filter(|o| o.succeeded()).count();
    let cancelled_items = outcomes
        .iter()
        .filter(|o| o.state == crate::batch::ProcessingState::Cancelled)
        .count();
    let cache_hits = outcomes.iter().filter(|o| o.cache_hit).count();
    let workers_used: BTreeSet<String> = outcomes
        .iter()
        .filter_map(|o| o.worker_id.clone())
        .collect();

    let rate = |n: usize| {
        if total_items == 0 {
            0.0
        } else {
            n as f64 / total_items as f64
        }
    };

    AggregateReport {
        total_items,
        successful_items,
        failed_items: total_items - successful_items - cancelled_items,
        cancelled_items,
        success_rate: rate(successful_items),
        cache_hits,
        cache_hit_rate: rate(cache_hits),
        sub_batches,
        workers_used: workers_used.into_iter().collect(),
    }
}

/// Names of required fields the record lacks; null counts as missing
pub fn missing_required_fields<'a>(record: &Value, required: &'a [String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|field| record.get(field.as_str()).map_or(true, Value::is_null))
        .map(String::as_str)
        .collect()
}

/// Keep successful records carrying every required field, in input order
pub fn validate(outcomes: &[ItemOutcome], required: &[String]) -> (Vec<Value>, ValidationReport) {
    let mut valid = Vec::new();
    let mut report = ValidationReport::default();

    for outcome in outcomes.iter().filter(|o| o.succeeded()) {
        let Some(record) = outcome.record.as_ref() else {
            continue;
        };
        let missing = missing_required_fields(record, required);
        if missing.is_empty() {
            valid.push(record.clone());
        } else {
            debug!(index = outcome.index, missing = ?missing, "Dropping record missing required fields");
            report.dropped.push(outcome.index);
        }
    }

    report.valid_items = valid.len();
    (valid, report)
}

/// Scored records plus tallies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoredRecords {
    pub records: Vec<Value>,
    pub annotated: usize,
    pub anomalies: usize,
}

/// Attach the scorer's annotation to each record; errors leave it untouched
pub async fn score(records: Vec<Value>, scorer: &dyn Scorer) -> ScoredRecords {
    let scored: Vec<(Value, Option<bool>)> = stream::iter(records)
        .map(|mut record| async move {
            match scorer.score(&record).await {
                Ok(Some(annotation)) => {
                    let is_anomaly = annotation.is_anomaly;
                    match (record.as_object_mut(), serde_json::to_value(&annotation)) {
                        (Some(object), Ok(value)) => {
                            object.insert(QUALITY_ANNOTATION_KEY.to_string(), value);
                            (record, Some(is_anomaly))
                        }
                        _ => (record, None),
                    }
                }
                Ok(None) => (record, None),
                Err(e) => {
                    warn!(scorer = scorer.name(), error = %e, "Scorer failed, passing record through unannotated");
                    (record, None)
                }
            }
        })
        .buffered(SCORE_CONCURRENCY)
        .collect()
        .await;

    let mut result = ScoredRecords::default();
    for (record, annotation) in scored {
        if let Some(is_anomaly) = annotation {
            result.annotated += 1;
            if is_anomaly {
                result.anomalies += 1;
            }
        }
        result.records.push(record);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ProcessingState;
    use crate::pipeline::scorer::{QualityAnnotation, ScorerError};
    use async_trait::async_trait;
    use serde_json::json;

    fn outcome(index: usize, state: ProcessingState, record: Option<Value>) -> ItemOutcome {
        ItemOutcome {
            index,
            state,
            record,
            error: None,
            worker_id: Some(format!("w{}", index % 2)),
            cache_hit: index == 0,
            retry_count: 0,
            duration: Duration::from_millis(1),
        }
    }

    struct EvenScorer;

    #[async_trait]
    impl Scorer for EvenScorer {
        async fn score(&self, record: &Value) -> Result<Option<QualityAnnotation>, ScorerError> {
            let id = record["id"].as_u64().unwrap_or(0);
            if id % 2 == 0 {
                Ok(Some(QualityAnnotation {
                    quality_score: 0.9,
                    is_anomaly: id == 4,
                    recommendation: "keep".to_string(),
                }))
            } else {
                Err(ScorerError::Unavailable("model offline".to_string()))
            }
        }
    }

    #[test]
    fn test_resolve_prefers_explicit_then_adaptive_then_default() {
        let defaults = PipelineConfig::default();

        let explicit = StageConfig::new().with_batch_size(7).resolve(&defaults, 30);
        assert_eq!(explicit.batch_size, 7);

        let adaptive = StageConfig::new().with_adaptive_batch_size().resolve(&defaults, 30);
        assert_eq!(adaptive.batch_size, 30);

        let fallback = StageConfig::new().resolve(&defaults, 30);
        assert_eq!(fallback.batch_size, defaults.default_batch_size);
        assert_eq!(fallback.task_type, "default");
    }

    #[test]
    fn test_cache_key_uses_field_value() {
        let record = json!({"place_id": "abc", "count": 3});
        assert_eq!(
            result_cache_key("enrich", "place_id", &record).as_deref(),
            Some("result:enrich:abc")
        );
        assert_eq!(
            result_cache_key("enrich", "count", &record).as_deref(),
            Some("result:enrich:3")
        );
        assert_eq!(result_cache_key("enrich", "missing", &record), None);
    }

    #[test]
    fn test_aggregate_counts_and_rates() {
        let outcomes = vec![
            outcome(0, ProcessingState::Completed, Some(json!({}))),
            outcome(1, ProcessingState::Completed, Some(json!({}))),
            outcome(2, ProcessingState::Failed, None),
            outcome(3, ProcessingState::Cancelled, None),
        ];

        let report = aggregate(&outcomes, 2);
        assert_eq!(report.total_items, 4);
        assert_eq!(report.successful_items, 2);
        assert_eq!(report.failed_items, 1);
        assert_eq!(report.cancelled_items, 1);
        assert!((report.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((report.cache_hit_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(report.workers_used, vec!["w0".to_string(), "w1".to_string()]);
    }

    #[test]
    fn test_validate_drops_records_missing_fields() {
        let outcomes = vec![
            outcome(0, ProcessingState::Completed, Some(json!({"name": "a", "phone": "1"}))),
            outcome(1, ProcessingState::Completed, Some(json!({"name": "b"}))),
            outcome(2, ProcessingState::Completed, Some(json!({"name": "c", "phone": null}))),
            outcome(3, ProcessingState::Failed, None),
        ];
        let required = vec!["name".to_string(), "phone".to_string()];

        let (valid, report) = validate(&outcomes, &required);
        assert_eq!(valid, vec![json!({"name": "a", "phone": "1"})]);
        assert_eq!(report.valid_items, 1);
        assert_eq!(report.dropped, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_score_passes_through_on_scorer_error() {
        let records = vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 4})];

        let scored = score(records, &EvenScorer).await;
        assert_eq!(scored.records.len(), 3);
        assert_eq!(scored.records[0], json!({"id": 1}));
        assert_eq!(scored.records[1][QUALITY_ANNOTATION_KEY]["quality_score"], json!(0.9));
        assert_eq!(scored.annotated, 2);
        assert_eq!(scored.anomalies, 1);
    }
}
