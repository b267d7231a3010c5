//! # Cache Layer
//!
//! Tiered key/value cache: a networked Redis tier when configured and
//! reachable, otherwise a process-local map with the same contract.
//!
//! The cache is an optimization, never a source of truth. Every public
//! operation on [`TieredCache`] returns a plain value (`Option<T>`, `bool`,
//! `u64`) rather than an error; failures are counted in [`CacheStats`] and
//! logged.

pub mod codec;
pub mod errors;
pub mod provider;
pub mod providers;
pub mod traits;

pub use codec::CompressionPolicy;
pub use errors::{CacheError, CacheResult};
pub use provider::{CacheStats, TieredCache};
pub use traits::CacheService;
