//! Redis cache tier
//!
//! Uses `redis::aio::ConnectionManager` for async multiplexed connections
//! with automatic reconnection. Requires the `cache-redis` feature flag.

use crate::cache::errors::{CacheError, CacheResult};
use crate::cache::traits::CacheService;
use crate::config::loader::redact_url;
use std::time::Duration;
use tracing::debug;

/// Redis-backed cache service
///
/// Clones share one multiplexed connection; the client library is safe for
/// concurrent use so no extra locking is needed.
#[derive(Clone)]
pub struct RedisCacheService {
    connection_manager: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisCacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheService")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisCacheService {
    /// Connect, giving up after `connect_timeout`
    pub async fn connect(url: &str, connect_timeout: Duration) -> CacheResult<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            CacheError::ConnectionError(format!("Failed to create Redis client: {e}"))
        })?;

        let connection_manager =
            tokio::time::timeout(connect_timeout, redis::aio::ConnectionManager::new(client))
                .await
                .map_err(|_| {
                    CacheError::Timeout(format!(
                        "connecting to {} after {}ms",
                        redact_url(url),
                        connect_timeout.as_millis()
                    ))
                })?
                .map_err(|e| {
                    CacheError::ConnectionError(format!("Failed to connect to Redis: {e}"))
                })?;

        debug!(url = %redact_url(url), "Redis cache tier connected");

        Ok(Self { connection_manager })
    }
}

impl CacheService for RedisCacheService {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::BackendError(format!("Redis GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.connection_manager.clone();
        let ttl_seconds = ttl.as_secs().max(1);

        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::BackendError(format!("Redis SET failed: {e}")))
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection_manager.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::BackendError(format!("Redis DEL failed: {e}")))?;
        Ok(removed > 0)
    }

    /// Redis expires keys natively; the sweep repairs keys that lost their
    /// TTL (e.g. written by another client) so nothing under a swept prefix
    /// lives forever.
    async fn sweep_expired(&self, prefixes: &[String], default_ttl: Duration) -> CacheResult<u64> {
        let mut conn = self.connection_manager.clone();
        let mut repaired: u64 = 0;

        for prefix in prefixes {
            let pattern = format!("{prefix}*");
            let mut cursor: u64 = 0;

            // SCAN iterates without blocking the server
            loop {
                let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CacheError::BackendError(format!("Redis SCAN failed: {e}")))?;

                for key in keys {
                    let ttl: i64 = redis::cmd("TTL")
                        .arg(&key)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| CacheError::BackendError(format!("Redis TTL failed: {e}")))?;

                    // -1: key exists without an expiry
                    if ttl == -1 {
                        redis::cmd("EXPIRE")
                            .arg(&key)
                            .arg(default_ttl.as_secs().max(1))
                            .query_async::<()>(&mut conn)
                            .await
                            .map_err(|e| {
                                CacheError::BackendError(format!("Redis EXPIRE failed: {e}"))
                            })?;
                        repaired += 1;
                    }
                }

                cursor = next_cursor;
                if cursor == 0 {
                    break;
                }
            }
        }

        debug!(prefixes = ?prefixes, repaired = repaired, "Redis sweep complete");
        Ok(repaired)
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.connection_manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::BackendError(format!("Redis PING failed: {e}")))?;

        Ok(pong == "PONG")
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }

    fn is_distributed(&self) -> bool {
        true
    }
}
