//! In-process cache tier backed by `DashMap`
//!
//! Used directly when no networked cluster is configured, and as the
//! fallback when the cluster cannot be reached at startup. Entries carry
//! their own deadline and are expired lazily on read; `sweep_expired`
//! reclaims the rest. Nothing survives a restart.

use crate::cache::errors::CacheResult;
use crate::cache::traits::CacheService;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: Vec<u8>,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCacheService {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryCacheService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently held, including expired ones not yet reclaimed
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheService for MemoryCacheService {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.payload.clone()),
            Some(_) => None,
            None => return Ok(None),
        };

        if hit.is_none() {
            // Guard is released above; re-check under the shard lock
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
            debug!(key = key, "Cache entry expired on read (memory)");
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                payload: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn sweep_expired(&self, prefixes: &[String], _default_ttl: Duration) -> CacheResult<u64> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let in_scope = prefixes.iter().any(|prefix| key.starts_with(prefix.as_str()));
            !(in_scope && entry.is_expired(now))
        });
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }

    fn is_distributed(&self) -> bool {
        false
    }
}
