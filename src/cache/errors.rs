//! Cache error types

use thiserror::Error;

/// Errors raised inside the cache layer
///
/// None of these reach pipeline callers: `TieredCache` converts them into a
/// miss (reads) or `false` (writes) after counting them.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Failed to connect to cache backend
    #[error("Cache connection error: {0}")]
    ConnectionError(String),

    /// Failed to serialize or deserialize cache value
    #[error("Cache serialization error: {0}")]
    SerializationError(String),

    /// Gzip framing could not be written or read
    #[error("Cache compression error: {0}")]
    CompressionError(String),

    /// Cache operation timed out
    #[error("Cache operation timed out: {0}")]
    Timeout(String),

    /// Generic backend error
    #[error("Cache backend error: {0}")]
    BackendError(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
