//! # Load-Balanced Selector
//!
//! Chooses a worker for a task. Candidates come from one consistent read of
//! the [`WorkerHealthRegistry`]; the configured [`SelectionStrategy`] picks
//! among them. The strategy is fixed at construction.

pub mod strategies;

pub use crate::config::SelectionAlgorithm;
pub use strategies::{
    build_strategy, HealthBased, LeastConnections, SelectionStrategy, WeightedRoundRobin,
};

use crate::config::LoadBalancingConfig;
use crate::error::{ConductorError, Result};
use crate::workers::WorkerHealthRegistry;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct LoadBalancer {
    registry: Arc<WorkerHealthRegistry>,
    strategy: Box<dyn SelectionStrategy>,
    config: LoadBalancingConfig,
}

impl LoadBalancer {
    pub fn new(registry: Arc<WorkerHealthRegistry>, config: LoadBalancingConfig) -> Self {
        let strategy = build_strategy(config.algorithm, None);
        Self::with_strategy(registry, config, strategy)
    }

    /// Inject a specific strategy instance (e.g. a seeded weighted strategy)
    pub fn with_strategy(
        registry: Arc<WorkerHealthRegistry>,
        config: LoadBalancingConfig,
        strategy: Box<dyn SelectionStrategy>,
    ) -> Self {
        debug!(strategy = strategy.name(), "⚖️ Load balancer initialized");
        Self {
            registry,
            strategy,
            config,
        }
    }

    /// Pick a worker, or `None` when nothing has capacity
    pub fn select_worker(&self, task_type: &str, priority: u8) -> Option<String> {
        let candidates = self.registry.available_workers();
        if candidates.is_empty() {
            debug!(task_type = %task_type, "No worker capacity available");
            return None;
        }

        let selected = self.strategy.select(&candidates, task_type, priority);
        debug!(
            task_type = %task_type,
            priority,
            candidates = candidates.len(),
            selected = ?selected,
            strategy = self.strategy.name(),
            "Worker selected"
        );
        selected
    }

    /// As [`select_worker`](Self::select_worker), surfacing "no capacity" as a typed error
    pub fn try_select_worker(&self, task_type: &str, priority: u8) -> Result<String> {
        self.select_worker(task_type, priority)
            .ok_or_else(|| ConductorError::NoCapacity {
                task_type: task_type.to_string(),
            })
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn config(&self) -> &LoadBalancingConfig {
        &self.config
    }
}
