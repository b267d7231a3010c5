//! Error types for the conductor core.

use crate::cache::CacheError;
use crate::config::ConfigurationError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConductorError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Worker not found: {worker_id}")]
    WorkerNotFound { worker_id: String },
    #[error("No worker capacity available for task type '{task_type}'")]
    NoCapacity { task_type: String },
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: Uuid },
    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Stage '{stage}' failed after {attempts} attempt(s): {reason}")]
    StageFailed {
        stage: String,
        attempts: u32,
        reason: String,
    },
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    /// True for errors a caller may reasonably retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConductorError::Timeout { .. } | ConductorError::Cache(_) | ConductorError::NoCapacity { .. }
        )
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(error: serde_json::Error) -> Self {
        ConductorError::InvalidInput(format!("JSON serialization error: {error}"))
    }
}

impl From<ConfigurationError> for ConductorError {
    fn from(error: ConfigurationError) -> Self {
        ConductorError::Configuration(error.to_string())
    }
}

impl From<CacheError> for ConductorError {
    fn from(error: CacheError) -> Self {
        ConductorError::Cache(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
