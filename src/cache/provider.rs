//! Tiered cache with graceful fallback and an integrated circuit breaker
//!
//! Enum dispatch over the available tiers. Consumers use [`TieredCache`]
//! and always receive a well-defined outcome: reads degrade to a miss and
//! writes to `false`, whatever the backend does.

use super::codec::{self, CompressionPolicy};
use super::errors::{CacheError, CacheResult};
use super::providers::MemoryCacheService;
use super::traits::CacheService;
use crate::config::CacheConfig;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ExponentialBackoff};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(feature = "cache-redis")]
use super::providers::RedisCacheService;

#[derive(Debug, Clone)]
enum CacheBackend {
    #[cfg(feature = "cache-redis")]
    Redis(Box<RedisCacheService>),
    Memory(MemoryCacheService),
}

impl CacheBackend {
    fn provider_name(&self) -> &'static str {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.provider_name(),
            Self::Memory(s) => s.provider_name(),
        }
    }

    fn is_distributed(&self) -> bool {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.is_distributed(),
            Self::Memory(s) => s.is_distributed(),
        }
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.get(key).await,
            Self::Memory(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.set(key, value, ttl).await,
            Self::Memory(s) => s.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.delete(key).await,
            Self::Memory(s) => s.delete(key).await,
        }
    }

    async fn sweep_expired(&self, prefixes: &[String], default_ttl: Duration) -> CacheResult<u64> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.sweep_expired(prefixes, default_ttl).await,
            Self::Memory(s) => s.sweep_expired(prefixes, default_ttl).await,
        }
    }

    async fn health_check(&self) -> CacheResult<bool> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.health_check().await,
            Self::Memory(s) => s.health_check().await,
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: String,
    pub distributed: bool,
    /// A networked tier was configured but the in-process tier is serving
    pub fallback_active: bool,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub error_rate: f64,
    pub circuit_state: Option<CircuitState>,
}

/// Tiered key/value cache
///
/// ## Tiers
///
/// - **Redis**: shared across processes; operations are retried with
///   exponential backoff and guarded by a circuit breaker
/// - **Memory**: process-local `DashMap` with lazy expiry, used when no
///   cluster is configured or the cluster is unreachable at startup
///
/// Keys are namespaced as `{key_prefix}:{key}`.
#[derive(Clone)]
pub struct TieredCache {
    backend: CacheBackend,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    backoff: ExponentialBackoff,
    max_retries: u32,
    key_prefix: String,
    default_ttl: Duration,
    compression: CompressionPolicy,
    sweep_prefixes: Vec<String>,
    fallback_active: bool,
    counters: Arc<CacheCounters>,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("backend", &self.backend.provider_name())
            .field("fallback_active", &self.fallback_active)
            .field(
                "circuit_breaker",
                &self.circuit_breaker.as_ref().map(|cb| cb.state()),
            )
            .finish()
    }
}

impl TieredCache {
    /// Build a cache from configuration, never failing
    ///
    /// If a Redis URL is configured but the connection fails (or the
    /// `cache-redis` feature is off), logs a warning and serves from the
    /// in-process tier instead.
    pub async fn connect(config: &CacheConfig) -> Self {
        match &config.redis_url {
            None => {
                info!("📦 No distributed cache configured, using in-process tier");
                Self::with_backend(config, CacheBackend::Memory(MemoryCacheService::new()), false)
            }
            Some(url) => Self::connect_distributed(config, url).await,
        }
    }

    #[cfg(feature = "cache-redis")]
    async fn connect_distributed(config: &CacheConfig, url: &str) -> Self {
        match RedisCacheService::connect(url, config.connect_timeout()).await {
            Ok(service) => {
                info!(backend = "redis", "📦 Distributed cache tier connected");
                Self::with_backend(config, CacheBackend::Redis(Box::new(service)), false)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "⚠️ Distributed cache unreachable, falling back to in-process tier"
                );
                Self::with_backend(config, CacheBackend::Memory(MemoryCacheService::new()), true)
            }
        }
    }

    #[cfg(not(feature = "cache-redis"))]
    async fn connect_distributed(config: &CacheConfig, _url: &str) -> Self {
        warn!("⚠️ Redis URL configured but cache-redis feature is disabled, using in-process tier");
        Self::with_backend(config, CacheBackend::Memory(MemoryCacheService::new()), true)
    }

    /// In-process tier only
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::with_backend(config, CacheBackend::Memory(MemoryCacheService::new()), false)
    }

    fn with_backend(config: &CacheConfig, backend: CacheBackend, fallback_active: bool) -> Self {
        let circuit_breaker = backend.is_distributed().then(|| {
            Arc::new(CircuitBreaker::new(
                "distributed_cache".to_string(),
                CircuitBreakerConfig::for_cache(config),
            ))
        });

        let key_prefix = config.key_prefix.clone();
        let sweep_prefixes = config
            .sweep_prefixes
            .iter()
            .map(|p| format!("{key_prefix}:{p}"))
            .collect();

        Self {
            backend,
            circuit_breaker,
            backoff: ExponentialBackoff::new(
                config.retry_base_delay(),
                config.retry_base_delay() * 20,
            ),
            max_retries: config.max_retries,
            key_prefix,
            default_ttl: config.default_ttl(),
            compression: CompressionPolicy {
                enabled: config.compression_enabled,
                threshold_bytes: config.compression_threshold_bytes,
            },
            sweep_prefixes,
            fallback_active,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Run a backend operation with retry (distributed tier only) and
    /// breaker protection. `None` means the operation did not complete.
    async fn guarded<T, F, Fut>(&self, op_name: &'static str, operation: F) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = CacheResult<T>>,
    {
        if let Some(cb) = &self.circuit_breaker {
            if !cb.should_allow() {
                debug!(operation = op_name, "Cache circuit open, skipping backend");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let attempts = if self.backend.is_distributed() {
            self.max_retries + 1
        } else {
            1
        };

        let result = self
            .backoff
            .retry(attempts, is_retryable, |_| operation())
            .await;

        match result {
            Ok(value) => {
                if let Some(cb) = &self.circuit_breaker {
                    cb.record_success();
                }
                Some(value)
            }
            Err(e) => {
                if let Some(cb) = &self.circuit_breaker {
                    cb.record_failure();
                }
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(operation = op_name, error = %e, attempts, "Cache operation failed");
                None
            }
        }
    }

    /// Read and decode a value; any failure is reported as a miss
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = self.namespaced(key);
        let payload = self
            .guarded("get", || self.backend.get(&full_key))
            .await
            .flatten();

        let Some(bytes) = payload else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match codec::decode(&bytes) {
            Ok(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "Discarding undecodable cache entry");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Encode and store a value; `ttl` defaults to the configured TTL
    ///
    /// Returns whether the write landed.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let full_key = self.namespaced(key);
        let payload = match codec::encode(value, self.compression) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache value could not be encoded");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let ttl = ttl.unwrap_or(self.default_ttl);

        let stored = self
            .guarded("set", || self.backend.set(&full_key, &payload, ttl))
            .await
            .is_some();
        if stored {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
        stored
    }

    pub async fn delete(&self, key: &str) -> bool {
        let full_key = self.namespaced(key);
        self.guarded("delete", || self.backend.delete(&full_key))
            .await
            .unwrap_or(false)
    }

    /// Advisory housekeeping over the configured sweep prefixes
    pub async fn sweep_expired(&self) -> u64 {
        let swept = self
            .guarded("sweep", || {
                self.backend
                    .sweep_expired(&self.sweep_prefixes, self.default_ttl)
            })
            .await
            .unwrap_or(0);

        debug!(
            backend = self.backend.provider_name(),
            swept = swept,
            "🧹 Cache sweep finished"
        );
        swept
    }

    pub async fn health_check(&self) -> bool {
        match self.backend.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                debug!(error = %e, "Cache health check failed");
                false
            }
        }
    }

    /// Cache health in [0, 1]: 0 when the backend is unreachable, otherwise
    /// 1.0 while the error rate stays under 10% and `1 - error_rate` above it
    pub async fn health_score(&self) -> f64 {
        if !self.health_check().await {
            return 0.0;
        }
        let error_rate = self.stats().error_rate;
        if error_rate < 0.1 {
            1.0
        } else {
            (1.0 - error_rate).clamp(0.0, 1.0)
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let writes = self.counters.writes.load(Ordering::Relaxed);
        let errors = self.counters.errors.load(Ordering::Relaxed);

        let reads = hits + misses;
        let operations = reads + writes;
        CacheStats {
            backend: self.backend.provider_name().to_string(),
            distributed: self.backend.is_distributed(),
            fallback_active: self.fallback_active,
            hits,
            misses,
            writes,
            errors,
            hit_rate: ratio(hits, reads),
            error_rate: ratio(errors, operations.max(errors)),
            circuit_state: self.circuit_breaker.as_ref().map(|cb| cb.state()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.provider_name()
    }

    pub fn is_fallback_active(&self) -> bool {
        self.fallback_active
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn is_retryable(error: &CacheError) -> bool {
    !matches!(
        error,
        CacheError::SerializationError(_) | CacheError::CompressionError(_)
    )
}
