//! # System Constants
//!
//! Operational boundaries shared across the orchestration core: health
//! classification thresholds, selection cut-offs and cache key layout.

/// Overall-health thresholds used to classify a health snapshot
pub mod health {
    pub const HEALTHY_THRESHOLD: f64 = 0.9;
    pub const DEGRADED_THRESHOLD: f64 = 0.7;
    pub const CRITICAL_THRESHOLD: f64 = 0.5;
}

/// Worker selection limits
pub mod selection {
    /// Workers at or above this load are never offered to a strategy
    pub const MAX_SELECTABLE_LOAD: f64 = 0.9;
    /// Response time at which the health-based latency score reaches zero (ms)
    pub const RESPONSE_TIME_CEILING_MS: f64 = 1000.0;
    /// Neutral priority; weights grow or shrink by 10% per step away from it
    pub const NEUTRAL_PRIORITY: u8 = 5;
    /// Default affinity for task types a worker declares nothing about
    pub const DEFAULT_AFFINITY: f64 = 1.0;
}

/// Worker error-rate tripping performed during health checks
pub mod error_rate {
    /// Minimum finished tasks before a worker's failure ratio is trusted
    pub const MIN_SAMPLE_SIZE: u64 = 10;
}

/// Adaptive batch sizing heuristic bounds
pub mod batch_sizing {
    pub const MIN_BATCH_SIZE: usize = 5;
    pub const MAX_BATCH_SIZE: usize = 50;
    /// Divisor applied to a batch's total items to estimate its chunk size
    pub const ESTIMATE_DIVISOR: usize = 5;
    /// Batch success rate above which the processor breaker records a success
    pub const BREAKER_SUCCESS_RATE: f64 = 0.8;
}

/// Cache key layout
pub mod cache_keys {
    pub const RESULT_NAMESPACE: &str = "result";
    pub const SEPARATOR: &str = ":";
}

/// Annotation attached to scored records
pub const QUALITY_ANNOTATION_KEY: &str = "_quality";
