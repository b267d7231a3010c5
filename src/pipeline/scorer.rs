//! External quality scorer consulted by the final pipeline stage.
//!
//! Scoring is best-effort: an error leaves the record unannotated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScorerError {
    #[error("scorer unavailable: {0}")]
    Unavailable(String),

    #[error("scorer rejected record: {0}")]
    Rejected(String),
}

/// Annotation attached to a record under the `_quality` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAnnotation {
    pub quality_score: f64,
    pub is_anomaly: bool,
    pub recommendation: String,
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// `Ok(None)` means the scorer has nothing to say about this record
    async fn score(&self, record: &Value) -> Result<Option<QualityAnnotation>, ScorerError>;

    fn name(&self) -> &str {
        "scorer"
    }
}

/// Scorer that never annotates
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScorer;

#[async_trait]
impl Scorer for NullScorer {
    async fn score(&self, _record: &Value) -> Result<Option<QualityAnnotation>, ScorerError> {
        Ok(None)
    }

    fn name(&self) -> &str {
        "null"
    }
}
