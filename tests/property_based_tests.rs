//! Property-based checks for ordering, health classification and selection

mod common;

use common::fast_batch_config;
use conductor_core::balancer::{HealthBased, LeastConnections, SelectionStrategy, WeightedRoundRobin};
use conductor_core::batch::{AdaptiveBatchProcessor, WorkError};
use conductor_core::config::BatchConfig;
use conductor_core::workers::{SystemState, WorkerDescriptor};
use proptest::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_results_align_with_input(
        items in prop::collection::vec(0u64..1_000, 0..40),
        chunk in 1usize..16,
        concurrency in 1usize..6,
    ) {
        let processor = AdaptiveBatchProcessor::new(BatchConfig {
            max_concurrent: concurrency,
            ..fast_batch_config()
        });
        let expected: Vec<u64> = items.iter().map(|n| n + 1).collect();

        let batch = runtime().block_on(processor.process_batch(
            items.clone(),
            |n| async move {
                // Uneven completion order
                tokio::time::sleep(Duration::from_micros(n % 7 * 100)).await;
                Ok::<_, WorkError>(n + 1)
            },
            Some(chunk),
        ));

        prop_assert_eq!(batch.total_items(), items.len());
        let values: Vec<u64> = batch.results().iter().filter_map(|r| r.data).collect();
        prop_assert_eq!(values, expected);
    }

    #[test]
    fn prop_health_classification_is_monotonic(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
        let rank = |state: SystemState| match state {
            SystemState::Healthy => 3,
            SystemState::Degraded => 2,
            SystemState::Critical => 1,
            _ => 0,
        };
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(rank(SystemState::classify(low)) <= rank(SystemState::classify(high)));
    }

    #[test]
    fn prop_strategies_pick_from_candidates(
        loads in prop::collection::vec((0u32..10, 0.0f64..500.0), 1..12),
        seed in any::<u64>(),
    ) {
        let workers: Vec<WorkerDescriptor> = loads
            .iter()
            .enumerate()
            .map(|(i, (active, response_ms))| {
                let mut worker = WorkerDescriptor::new(format!("w{i}"), HashMap::new());
                worker.active_tasks = *active;
                worker.load = f64::from(*active) / 10.0;
                worker.response_time_ms = *response_ms;
                worker
            })
            .collect();
        let ids: Vec<&str> = workers.iter().map(|w| w.worker_id.as_str()).collect();

        let strategies: Vec<Box<dyn SelectionStrategy>> = vec![
            Box::new(WeightedRoundRobin::with_seed(seed)),
            Box::new(LeastConnections),
            Box::new(HealthBased),
        ];
        for strategy in strategies {
            let picked = strategy.select(&workers, "default", 5);
            prop_assert!(picked.map(|id| ids.contains(&id.as_str())).unwrap_or(false));
        }

        let min_active = workers.iter().map(|w| w.active_tasks).min().unwrap();
        let least = LeastConnections.select(&workers, "default", 5).unwrap();
        let chosen = workers.iter().find(|w| w.worker_id == least).unwrap();
        prop_assert_eq!(chosen.active_tasks, min_active);
    }
}
