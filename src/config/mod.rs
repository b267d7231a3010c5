//! # Conductor Configuration System
//!
//! Layered, validated configuration for the orchestration core.
//!
//! ## Architecture
//!
//! - **Typed sections**: one struct per component, every field defaulted so
//!   partial files are valid
//! - **Environment awareness**: base file plus optional `conductor.{env}.toml`
//!   overlay and `CONDUCTOR__SECTION__KEY` variable overrides
//! - **Explicit validation**: out-of-range values are rejected up front
//!
//! ## Usage
//!
//! ```rust,no_run
//! use conductor_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let interval = manager.config().load_balancing.health_check_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `conductor.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Worker selection, health and scaling policy
    pub load_balancing: LoadBalancingConfig,
    /// Per-worker breaker and recovery timing
    pub failover: FailoverConfig,
    /// Adaptive batch processor tuning
    pub batch: BatchConfig,
    /// Tiered cache tuning
    pub cache: CacheConfig,
    /// Distributed pipeline defaults
    pub pipeline: PipelineConfig,
    /// Background loop timing for the orchestrator facade
    pub orchestrator: OrchestratorConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

impl ConductorConfig {
    /// Validate every section, returning the first violation found
    pub fn validate(&self) -> ConfigResult<()> {
        self.load_balancing.validate()?;
        self.failover.validate()?;
        self.batch.validate()?;
        self.cache.validate()?;
        self.pipeline.validate()?;
        if self.orchestrator.optimization_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestrator.optimization_interval_seconds",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Worker selection algorithm, chosen once at construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAlgorithm {
    #[default]
    WeightedRoundRobin,
    LeastConnections,
    HealthBased,
}

impl SelectionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionAlgorithm::WeightedRoundRobin => "weighted_round_robin",
            SelectionAlgorithm::LeastConnections => "least_connections",
            SelectionAlgorithm::HealthBased => "health_based",
        }
    }
}

/// Load balancing and worker health policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub algorithm: SelectionAlgorithm,
    /// Overall health below which the health loop raises an alert
    pub health_threshold: f64,
    /// Task count at which a worker's load reaches 1.0
    pub max_tasks_per_worker: u32,
    pub auto_scale: bool,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub min_workers: u32,
    pub max_workers: u32,
    pub health_check_interval_seconds: u64,
    /// Consecutive failures before a worker is declared Failed
    pub failure_threshold: u32,
    /// Consecutive successful probes required to restore a failed worker
    pub recovery_threshold: u32,
    /// Failure ratio above which a worker is reported to failover during health checks
    pub circuit_breaker_threshold: f64,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: SelectionAlgorithm::WeightedRoundRobin,
            health_threshold: 0.7,
            max_tasks_per_worker: 10,
            auto_scale: false,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            min_workers: 1,
            max_workers: 10,
            health_check_interval_seconds: 30,
            failure_threshold: 3,
            recovery_threshold: 1,
            circuit_breaker_threshold: 0.5,
        }
    }
}

impl LoadBalancingConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        check_unit_interval("load_balancing.health_threshold", self.health_threshold)?;
        check_unit_interval("load_balancing.scale_up_threshold", self.scale_up_threshold)?;
        check_unit_interval(
            "load_balancing.scale_down_threshold",
            self.scale_down_threshold,
        )?;
        check_unit_interval(
            "load_balancing.circuit_breaker_threshold",
            self.circuit_breaker_threshold,
        )?;

        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(ConfigurationError::invalid_value(
                "load_balancing.scale_down_threshold",
                self.scale_down_threshold,
                "must be lower than scale_up_threshold",
            ));
        }
        if self.max_tasks_per_worker == 0 {
            return Err(ConfigurationError::invalid_value(
                "load_balancing.max_tasks_per_worker",
                0,
                "must be greater than 0",
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigurationError::invalid_value(
                "load_balancing.min_workers",
                self.min_workers,
                format!("must not exceed max_workers ({})", self.max_workers),
            ));
        }
        if self.health_check_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "load_balancing.health_check_interval_seconds",
                0,
                "must be greater than 0",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "load_balancing.failure_threshold",
                0,
                "must be greater than 0",
            ));
        }
        if self.recovery_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "load_balancing.recovery_threshold",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Per-worker breaker and recovery timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Failure count at which a worker's breaker opens (opens before the worker is Failed)
    pub breaker_open_threshold: u32,
    /// Minimum time a breaker stays open before a probe may close it
    pub breaker_timeout_ms: u64,
    /// Recovery delay grows by this much per attempt
    pub recovery_base_delay_ms: u64,
    /// Upper bound on the recovery delay
    pub recovery_max_delay_ms: u64,
    /// Bound on a single health probe
    pub probe_timeout_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            breaker_open_threshold: 2,
            breaker_timeout_ms: 30_000,
            recovery_base_delay_ms: 30_000,
            recovery_max_delay_ms: 300_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl FailoverConfig {
    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_timeout_ms)
    }

    pub fn recovery_base_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_base_delay_ms)
    }

    pub fn recovery_max_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_max_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.breaker_open_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "failover.breaker_open_threshold",
                0,
                "must be greater than 0",
            ));
        }
        if self.recovery_base_delay_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "failover.recovery_base_delay_ms",
                0,
                "must be greater than 0",
            ));
        }
        if self.recovery_max_delay_ms < self.recovery_base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "failover.recovery_max_delay_ms",
                self.recovery_max_delay_ms,
                "must be at least recovery_base_delay_ms",
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "failover.probe_timeout_ms",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Adaptive batch processor tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Semaphore size: maximum units of work in flight per processor
    pub max_concurrent: usize,
    /// Attempts per item, including the first
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Consecutive failed batches before the processor breaker opens
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_ms: u64,
    /// Batch size used until the throughput history has data
    pub default_batch_size: usize,
    /// Number of past batches kept for the sizing heuristic
    pub history_window: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            retry_attempts: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 60_000,
            default_batch_size: 20,
            history_window: 10,
        }
    }
}

impl BatchConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.max_concurrent",
                0,
                "must be greater than 0",
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.retry_attempts",
                0,
                "must be at least 1 (the first attempt)",
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.circuit_breaker_threshold",
                0,
                "must be greater than 0",
            ));
        }
        if self.default_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.default_batch_size",
                0,
                "must be greater than 0",
            ));
        }
        if self.history_window == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.history_window",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Tiered cache tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Networked tier; `None` selects the in-process tier directly
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub default_ttl_seconds: u64,
    pub compression_enabled: bool,
    /// Payloads at or above this size are gzip-compressed
    pub compression_threshold_bytes: usize,
    /// Retries after the first attempt for networked operations
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Key namespaces scanned by the expiry sweep
    pub sweep_prefixes: Vec<String>,
    pub breaker_failure_threshold: u32,
    pub breaker_timeout_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "conductor".to_string(),
            default_ttl_seconds: 3600,
            compression_enabled: true,
            compression_threshold_bytes: 1024,
            max_retries: 3,
            retry_base_delay_ms: 50,
            connect_timeout_ms: 2_000,
            sweep_prefixes: vec!["result".to_string()],
            breaker_failure_threshold: 5,
            breaker_timeout_seconds: 30,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.key_prefix.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "cache.key_prefix",
                "",
                "must not be empty",
            ));
        }
        if self.default_ttl_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "cache.default_ttl_seconds",
                0,
                "a TTL is always attached on SET and must be greater than 0",
            ));
        }
        if self.max_retries > 10 {
            return Err(ConfigurationError::invalid_value(
                "cache.max_retries",
                self.max_retries,
                "should not exceed 10",
            ));
        }
        if let Some(url) = &self.redis_url {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(ConfigurationError::invalid_value(
                    "cache.redis_url",
                    loader::redact_url(url),
                    "must use the redis:// or rediss:// scheme",
                ));
            }
        }
        Ok(())
    }
}

/// Distributed pipeline defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Items per worker-routed sub-batch
    pub default_batch_size: usize,
    /// Attempts per stage, including the first
    pub stage_retry_attempts: u32,
    pub stage_retry_base_delay_ms: u64,
    /// Fields every record must carry to pass validation
    pub required_fields: Vec<String>,
    pub default_task_type: String,
    /// How long finished jobs stay queryable before the optimization loop prunes them
    pub finished_job_retention_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 25,
            stage_retry_attempts: 2,
            stage_retry_base_delay_ms: 100,
            required_fields: Vec::new(),
            default_task_type: "default".to_string(),
            finished_job_retention_seconds: 3600,
        }
    }
}

impl PipelineConfig {
    pub fn stage_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.stage_retry_base_delay_ms)
    }

    pub fn finished_job_retention(&self) -> Duration {
        Duration::from_secs(self.finished_job_retention_seconds)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.default_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "pipeline.default_batch_size",
                0,
                "must be greater than 0",
            ));
        }
        if self.stage_retry_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "pipeline.stage_retry_attempts",
                0,
                "must be at least 1 (the first attempt)",
            ));
        }
        Ok(())
    }
}

/// Orchestrator background loop timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub optimization_interval_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            optimization_interval_seconds: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn optimization_interval(&self) -> Duration {
        Duration::from_secs(self.optimization_interval_seconds)
    }
}

/// Logging output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit filter directive; defaults by environment when unset
    pub level: Option<String>,
    pub json: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            ansi: true,
        }
    }
}

fn check_unit_interval(field: &str, value: f64) -> ConfigResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigurationError::invalid_value(
            field,
            value,
            "must be within [0.0, 1.0]",
        ));
    }
    Ok(())
}
