#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Conductor Core
//!
//! Worker-health-aware task orchestration: load-balances units of work across
//! a worker pool, isolates failing workers, runs multi-stage batch pipelines
//! and fronts them with a tiered cache.
//!
//! ## Module Organization
//!
//! - [`cache`] - Tiered key/value cache (Redis with an in-process fallback)
//! - [`batch`] - Bounded-concurrency adaptive batch processor
//! - [`workers`] - Worker registry, per-worker breakers and health snapshots
//! - [`balancer`] - Worker selection strategies
//! - [`failover`] - Worker quarantine and recovery probing
//! - [`pipeline`] - Multi-stage distributed jobs
//! - [`orchestrator`] - Façade, background loops and the control API
//! - [`resilience`] - Circuit breaker and exponential backoff primitives
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conductor_core::config::ConductorConfig;
//! use conductor_core::orchestrator::SmartOrchestrator;
//! use conductor_core::pipeline::StageConfig;
//! use serde_json::json;
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! # async fn example() -> conductor_core::Result<()> {
//! let orchestrator = SmartOrchestrator::builder(ConductorConfig::default())
//!     .build()
//!     .await?;
//! orchestrator.register_worker("worker-1", HashMap::new());
//! orchestrator.start().await?;
//!
//! let job = orchestrator.submit(vec![json!({"id": 1})], StageConfig::new())?;
//! let status = orchestrator.wait_for_job(&job, Duration::from_secs(30)).await?;
//! println!("job finished: {:?}", status.state);
//!
//! orchestrator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod batch;
pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod failover;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod resilience;
pub mod workers;

pub use balancer::{LoadBalancer, SelectionAlgorithm, SelectionStrategy};
pub use batch::{AdaptiveBatchProcessor, BatchResult, ProcessingResult, ProcessingState, WorkError};
pub use cache::{CacheStats, TieredCache};
pub use config::{ConductorConfig, ConfigManager};
pub use error::{ConductorError, Result};
pub use failover::FailoverController;
pub use orchestrator::{SmartOrchestrator, SmartOrchestratorBuilder, SystemStatus};
pub use pipeline::{DistributedPipeline, JobHandle, JobState, JobStatus, StageConfig};
pub use workers::{SystemHealthSnapshot, SystemState, WorkerDescriptor, WorkerHealthRegistry};
