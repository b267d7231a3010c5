//! Worker health accounting, selection exclusion and failover recovery

mod common;

use common::{init_test_logging, ScriptedProbe};
use conductor_core::balancer::{LoadBalancer, SelectionAlgorithm};
use conductor_core::config::{FailoverConfig, LoadBalancingConfig};
use conductor_core::failover::FailoverController;
use conductor_core::workers::{
    HealthProbe, NullHealthProbe, ResourceUsage, SystemState, WorkerHealthRegistry,
};
use conductor_core::ConductorError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn quick_failover() -> FailoverConfig {
    FailoverConfig {
        breaker_open_threshold: 3,
        breaker_timeout_ms: 10,
        recovery_base_delay_ms: 10,
        recovery_max_delay_ms: 40,
        probe_timeout_ms: 200,
    }
}

fn registry_with(workers: &[&str], lb: &LoadBalancingConfig, failover: &FailoverConfig) -> Arc<WorkerHealthRegistry> {
    let registry = Arc::new(WorkerHealthRegistry::new(lb, failover));
    for id in workers {
        registry.register_worker(id, HashMap::new());
    }
    registry
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[test]
fn test_health_aggregation_with_one_failed_worker() {
    let registry = registry_with(
        &["a", "b", "c", "d"],
        &LoadBalancingConfig::default(),
        &FailoverConfig::default(),
    );
    registry.force_fail("d").unwrap();

    let snapshot = registry.publish_snapshot(registry.build_snapshot(1.0, 1.0));

    assert_eq!(snapshot.total_workers, 4);
    assert_eq!(snapshot.healthy_workers, 3);
    assert_eq!(snapshot.failed_workers, 1);
    assert!((snapshot.worker_health - 0.75).abs() < 1e-9);
    assert!((snapshot.overall_health - 0.9167).abs() < 1e-4);
    assert_eq!(snapshot.state, SystemState::Healthy);
}

#[test]
fn test_low_cache_and_api_health_degrade_the_system() {
    let registry = registry_with(&["a", "b"], &LoadBalancingConfig::default(), &FailoverConfig::default());

    let snapshot = registry.build_snapshot(0.5, 0.6);

    assert!((snapshot.overall_health - 0.7).abs() < 1e-9);
    assert_eq!(snapshot.state, SystemState::Degraded);
    assert!(snapshot.issues.iter().any(|issue| issue.contains("cache")));
    assert!(snapshot.issues.iter().any(|issue| issue.contains("API")));
}

#[test]
fn test_open_breaker_excludes_worker_from_selection() {
    let lb = LoadBalancingConfig {
        algorithm: SelectionAlgorithm::WeightedRoundRobin,
        ..Default::default()
    };
    let registry = registry_with(&["w1", "w2", "w3"], &lb, &quick_failover());
    let balancer = LoadBalancer::new(Arc::clone(&registry), lb);

    for _ in 0..3 {
        registry.record_failure("w1").unwrap();
    }
    assert!(registry.breaker_state("w1").unwrap().is_open);

    for _ in 0..100 {
        let picked = balancer.select_worker("default", 5).unwrap();
        assert_ne!(picked, "w1");
    }
}

#[tokio::test]
async fn test_open_breaker_clears_after_timeout_and_health_check() {
    init_test_logging();
    let lb = LoadBalancingConfig {
        algorithm: SelectionAlgorithm::LeastConnections,
        failure_threshold: 5,
        ..Default::default()
    };
    let failover_config = FailoverConfig {
        breaker_timeout_ms: 150,
        ..quick_failover()
    };
    let registry = registry_with(&["w1", "w2"], &lb, &failover_config);
    let balancer = LoadBalancer::new(Arc::clone(&registry), lb);
    let probe = Arc::new(ScriptedProbe::new([false, true]));
    let failover = FailoverController::new(
        Arc::clone(&registry),
        Arc::clone(&probe) as Arc<dyn HealthProbe>,
        failover_config,
        1,
    );
    // w2 is busier so least-connections prefers w1 whenever it is routable
    registry.record_heartbeat("w2", 3, None, ResourceUsage::default());

    let opened_at = tokio::time::Instant::now();
    for _ in 0..3 {
        failover.record_failure("w1").unwrap();
    }
    assert!(registry.breaker_state("w1").unwrap().is_open);
    assert!(!registry.is_failed("w1"));
    assert!(failover.is_recovering("w1"));

    for _ in 0..100 {
        assert_eq!(balancer.select_worker("default", 5).as_deref(), Some("w2"));
    }

    assert!(wait_until(|| balancer.select_worker("default", 5).as_deref() == Some("w1")).await);
    assert!(opened_at.elapsed() >= Duration::from_millis(150));
    assert_eq!(probe.calls(), 2);
    assert_eq!(registry.breaker_state("w1").unwrap().failure_count, 0);

    failover.shutdown().await;
}

#[test]
fn test_every_strategy_respects_exclusions() {
    for algorithm in [
        SelectionAlgorithm::WeightedRoundRobin,
        SelectionAlgorithm::LeastConnections,
        SelectionAlgorithm::HealthBased,
    ] {
        let lb = LoadBalancingConfig {
            algorithm,
            ..Default::default()
        };
        let registry = registry_with(&["a", "b", "c"], &lb, &FailoverConfig::default());
        registry.force_fail("a").unwrap();
        // Saturated workers are not candidates either
        registry.record_heartbeat("b", lb.max_tasks_per_worker, None, ResourceUsage::default());
        let balancer = LoadBalancer::new(Arc::clone(&registry), lb);

        for _ in 0..20 {
            assert_eq!(balancer.select_worker("default", 5).as_deref(), Some("c"));
        }
    }
}

#[test]
fn test_no_candidates_reports_no_capacity() {
    let lb = LoadBalancingConfig::default();
    let registry = registry_with(&["only"], &lb, &FailoverConfig::default());
    registry.force_fail("only").unwrap();
    let balancer = LoadBalancer::new(Arc::clone(&registry), lb);

    assert!(balancer.select_worker("default", 5).is_none());
    assert!(matches!(
        balancer.try_select_worker("default", 5),
        Err(ConductorError::NoCapacity { .. })
    ));
}

#[tokio::test]
async fn test_forced_failover_is_idempotent() {
    init_test_logging();
    let registry = registry_with(&["w1"], &LoadBalancingConfig::default(), &FailoverConfig::default());
    let failover = FailoverController::new(
        Arc::clone(&registry),
        Arc::new(NullHealthProbe),
        FailoverConfig::default(),
        1,
    );

    failover.force_failover("w1").unwrap();
    let first = registry.breaker_state("w1").unwrap();
    failover.force_failover("w1").unwrap();
    let second = registry.breaker_state("w1").unwrap();

    assert!(registry.is_failed("w1"));
    assert!(second.is_open);
    assert_eq!(first.failure_count, second.failure_count);
    assert_eq!(failover.pending_recoveries(), vec!["w1".to_string()]);

    failover.shutdown().await;
    assert!(failover.pending_recoveries().is_empty());
}

#[tokio::test]
async fn test_recovery_probes_until_worker_passes() {
    init_test_logging();
    info!("🧪 Recovery after two failed probes");

    let lb = LoadBalancingConfig::default();
    let registry = registry_with(&["w1", "w2"], &lb, &quick_failover());
    let probe = Arc::new(ScriptedProbe::new([false, false, true]));
    let failover = FailoverController::new(
        Arc::clone(&registry),
        Arc::clone(&probe) as Arc<dyn HealthProbe>,
        quick_failover(),
        1,
    );

    failover.force_failover("w1").unwrap();
    assert!(failover.is_recovering("w1"));
    assert!(registry.available_workers().iter().all(|w| w.worker_id != "w1"));

    let restored = wait_until(|| !registry.is_failed("w1")).await;
    assert!(restored, "worker should be restored once the probe passes");
    assert!(wait_until(|| !failover.is_recovering("w1")).await);
    assert_eq!(probe.calls(), 3);
    assert!(!registry.breaker_state("w1").unwrap().is_open);
    assert!(registry.available_workers().iter().any(|w| w.worker_id == "w1"));

    failover.shutdown().await;
}

#[tokio::test]
async fn test_recovery_threshold_requires_consecutive_passes() {
    let registry = registry_with(&["w1"], &LoadBalancingConfig::default(), &quick_failover());
    let probe = Arc::new(ScriptedProbe::new([true, false, true, true]));
    let failover = FailoverController::new(
        Arc::clone(&registry),
        Arc::clone(&probe) as Arc<dyn HealthProbe>,
        quick_failover(),
        2,
    );

    failover.force_failover("w1").unwrap();

    assert!(wait_until(|| !registry.is_failed("w1")).await);
    assert_eq!(probe.calls(), 4);
    failover.shutdown().await;
}

#[tokio::test]
async fn test_repeated_failures_trigger_failover() {
    let lb = LoadBalancingConfig {
        failure_threshold: 3,
        ..Default::default()
    };
    let registry = registry_with(&["w1"], &lb, &quick_failover());
    let failover = FailoverController::new(
        Arc::clone(&registry),
        Arc::new(NullHealthProbe),
        FailoverConfig {
            recovery_base_delay_ms: 60_000,
            recovery_max_delay_ms: 60_000,
            ..quick_failover()
        },
        1,
    );

    for expected in 1..=3 {
        let outcome = failover.record_failure("w1").unwrap();
        assert_eq!(outcome.failure_count, expected);
    }

    assert!(registry.is_failed("w1"));
    assert!(failover.is_recovering("w1"));

    failover.deregister_worker("w1").unwrap();
    assert!(!failover.is_recovering("w1"));
    assert!(!registry.contains("w1"));
    failover.shutdown().await;
}

#[tokio::test]
async fn test_unknown_worker_is_an_error() {
    let registry = registry_with(&[], &LoadBalancingConfig::default(), &FailoverConfig::default());
    let failover = FailoverController::new(registry, Arc::new(NullHealthProbe), FailoverConfig::default(), 1);

    assert!(matches!(
        failover.force_failover("ghost"),
        Err(ConductorError::WorkerNotFound { .. })
    ));
    assert!(failover.record_failure("ghost").is_err());
    assert!(failover.reset_circuit_breaker("ghost").is_err());
}
