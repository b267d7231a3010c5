//! Cache backend trait

use super::errors::CacheResult;
use std::time::Duration;

/// Byte-level operations every cache tier provides
///
/// Backends see opaque payloads only; framing and compression are handled
/// by [`crate::cache::codec`] before values reach a backend.
pub trait CacheService: Send + Sync {
    /// Returns `Ok(Some(bytes))` on hit, `Ok(None)` on miss or expiry.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = CacheResult<Option<Vec<u8>>>> + Send;

    /// Store a payload; a TTL is always attached.
    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> impl std::future::Future<Output = CacheResult<()>> + Send;

    /// Returns whether a key was removed.
    fn delete(&self, key: &str) -> impl std::future::Future<Output = CacheResult<bool>> + Send;

    /// Housekeeping over keys starting with any of `prefixes`; returns the
    /// number of keys acted on.
    fn sweep_expired(
        &self,
        prefixes: &[String],
        default_ttl: Duration,
    ) -> impl std::future::Future<Output = CacheResult<u64>> + Send;

    fn health_check(&self) -> impl std::future::Future<Output = CacheResult<bool>> + Send;

    fn provider_name(&self) -> &'static str;

    /// Whether operations cross the network (and deserve retry and breaker protection)
    fn is_distributed(&self) -> bool;
}
