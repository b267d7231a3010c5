//! Tiered cache degrades to the in-process tier instead of failing

mod common;

use common::init_test_logging;
use conductor_core::cache::TieredCache;
use conductor_core::config::CacheConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payload {
    id: u32,
    tags: Vec<String>,
}

fn payload() -> Payload {
    Payload {
        id: 7,
        tags: vec!["alpha".to_string(), "beta".to_string()],
    }
}

#[tokio::test]
async fn test_no_url_serves_from_memory() {
    init_test_logging();
    let cache = TieredCache::connect(&CacheConfig {
        redis_url: None,
        ..Default::default()
    })
    .await;

    assert_eq!(cache.backend_name(), "memory");
    assert!(!cache.is_fallback_active());
    assert!(cache.set("payload", &payload(), None).await);
    assert_eq!(cache.get::<Payload>("payload").await, Some(payload()));
}

#[tokio::test]
async fn test_unreachable_redis_falls_back() {
    init_test_logging();
    let cache = TieredCache::connect(&CacheConfig {
        redis_url: Some("redis://127.0.0.1:1".to_string()),
        connect_timeout_ms: 500,
        ..Default::default()
    })
    .await;

    assert!(cache.is_fallback_active());
    assert_eq!(cache.backend_name(), "memory");
    assert!(cache.set("payload", &payload(), Some(Duration::from_secs(60))).await);
    assert_eq!(cache.get::<Payload>("payload").await, Some(payload()));

    let stats = cache.stats();
    assert!(stats.fallback_active);
    assert!(!stats.distributed);
    assert!(stats.circuit_state.is_none());
}

#[tokio::test]
async fn test_expired_entries_read_as_absent() {
    let cache = TieredCache::in_memory(&CacheConfig::default());

    cache
        .set("short", &"lived", Some(Duration::from_millis(20)))
        .await;
    assert_eq!(cache.get::<String>("short").await.as_deref(), Some("lived"));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get::<String>("short").await, None);
}

#[tokio::test]
async fn test_large_values_round_trip_with_compression() {
    let cache = TieredCache::in_memory(&CacheConfig {
        compression_enabled: true,
        compression_threshold_bytes: 64,
        ..Default::default()
    });
    let large: Vec<String> = (0..500).map(|i| format!("entry-{i}")).collect();

    assert!(cache.set("large", &large, None).await);
    assert_eq!(cache.get::<Vec<String>>("large").await, Some(large));
}

#[tokio::test]
async fn test_delete_and_stats() {
    let cache = TieredCache::in_memory(&CacheConfig::default());

    cache.set("k", &1u32, None).await;
    assert_eq!(cache.get::<u32>("k").await, Some(1));
    assert!(cache.delete("k").await);
    assert_eq!(cache.get::<u32>("k").await, None);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.writes, 1);
    assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    assert!((cache.health_score().await - 1.0).abs() < 1e-9);
}
