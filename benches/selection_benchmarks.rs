use conductor_core::balancer::{HealthBased, LeastConnections, SelectionStrategy, WeightedRoundRobin};
use conductor_core::workers::WorkerDescriptor;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashMap;

fn pool(size: usize) -> Vec<WorkerDescriptor> {
    (0..size)
        .map(|i| {
            let mut worker = WorkerDescriptor::new(format!("worker-{i:03}"), HashMap::new());
            worker.active_tasks = (i % 7) as u32;
            worker.load = (i % 9) as f64 / 10.0;
            worker.completed_tasks = 100 + i as u64;
            worker.failed_tasks = (i % 5) as u64;
            worker.response_time_ms = 50.0 + (i % 11) as f64 * 40.0;
            worker
        })
        .collect()
}

fn benchmark_strategy(c: &mut Criterion, name: &str, strategy: &dyn SelectionStrategy) {
    let workers = pool(64);
    c.bench_function(name, |b| {
        b.iter(|| strategy.select(black_box(&workers), black_box("enrichment"), black_box(7)))
    });
}

fn benchmark_weighted_round_robin(c: &mut Criterion) {
    benchmark_strategy(c, "select_weighted_round_robin_64", &WeightedRoundRobin::with_seed(7));
}

fn benchmark_least_connections(c: &mut Criterion) {
    benchmark_strategy(c, "select_least_connections_64", &LeastConnections);
}

fn benchmark_health_based(c: &mut Criterion) {
    benchmark_strategy(c, "select_health_based_64", &HealthBased);
}

criterion_group!(
    benches,
    benchmark_weighted_round_robin,
    benchmark_least_connections,
    benchmark_health_based
);
criterion_main!(benches);
