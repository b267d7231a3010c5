//! # Resilience Module
//!
//! Fault isolation primitives shared by the cache, the batch processor and
//! the pipeline stage runner.
//!
//! - [`CircuitBreaker`]: Closed/Open/HalfOpen guard driven by explicit
//!   `should_allow` / `record_*` calls
//! - [`ExponentialBackoff`]: capped exponential retry delays
//!
//! ```rust
//! use conductor_core::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     "distributed_cache".to_string(),
//!     CircuitBreakerConfig {
//!         failure_threshold: 2,
//!         timeout: Duration::from_secs(30),
//!         success_threshold: 1,
//!     },
//! );
//!
//! breaker.record_failure();
//! breaker.record_failure();
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(!breaker.should_allow());
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod config;

pub use backoff::ExponentialBackoff;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::CircuitBreakerConfig;
