//! Worker selection strategies.
//!
//! Every strategy receives the already-filtered candidate set (not failed,
//! breaker closed, load below 0.9), sorted by worker id, and returns the id
//! of its pick.

use crate::config::SelectionAlgorithm;
use crate::constants::selection::{NEUTRAL_PRIORITY, RESPONSE_TIME_CEILING_MS};
use crate::workers::WorkerDescriptor;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait SelectionStrategy: Send + Sync + std::fmt::Debug {
    fn select(&self, candidates: &[WorkerDescriptor], task_type: &str, priority: u8)
        -> Option<String>;

    fn name(&self) -> &'static str;
}

/// Build the strategy for a configured algorithm
///
/// `seed` only affects the weighted strategy.
pub fn build_strategy(
    algorithm: SelectionAlgorithm,
    seed: Option<u64>,
) -> Box<dyn SelectionStrategy> {
    match algorithm {
        SelectionAlgorithm::WeightedRoundRobin => Box::new(match seed {
            Some(seed) => WeightedRoundRobin::with_seed(seed),
            None => WeightedRoundRobin::new(),
        }),
        SelectionAlgorithm::LeastConnections => Box::new(LeastConnections),
        SelectionAlgorithm::HealthBased => Box::new(HealthBased),
    }
}

/// Proportional draw over
/// `(1 - load) * success_rate * (1 + (priority - 5) * 0.1) * affinity`
#[derive(Debug)]
pub struct WeightedRoundRobin {
    rng: Mutex<StdRng>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic draws for reproducible tests and benchmarks
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn weight(worker: &WorkerDescriptor, task_type: &str, priority: u8) -> f64 {
        let priority_factor = 1.0 + (priority as f64 - NEUTRAL_PRIORITY as f64) * 0.1;
        let weight = (1.0 - worker.load)
            * worker.success_rate()
            * priority_factor
            * worker.affinity_for(task_type);
        if weight.is_finite() {
            weight.max(0.0)
        } else {
            0.0
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for WeightedRoundRobin {
    fn select(
        &self,
        candidates: &[WorkerDescriptor],
        task_type: &str,
        priority: u8,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<f64> = candidates
            .iter()
            .map(|w| Self::weight(w, task_type, priority))
            .collect();
        let total: f64 = weights.iter().sum();

        let mut rng = self.rng.lock();
        if total <= 0.0 {
            // Every weight collapsed to zero: fall back to a uniform draw
            let index = rng.gen_range(0..candidates.len());
            return Some(candidates[index].worker_id.clone());
        }

        let target = rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (worker, weight) in candidates.iter().zip(&weights) {
            cumulative += weight;
            if target < cumulative {
                return Some(worker.worker_id.clone());
            }
        }
        candidates.last().map(|w| w.worker_id.clone())
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

/// Fewest `active_tasks`; ties go to the lowest worker id
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn select(&self, candidates: &[WorkerDescriptor], _task_type: &str, _priority: u8) -> Option<String> {
        candidates
            .iter()
            .min_by_key(|w| w.active_tasks)
            .map(|w| w.worker_id.clone())
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Highest `0.4 * success_rate + 0.4 * (1 - load) + 0.2 * latency_score`
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthBased;

impl HealthBased {
    pub fn score(worker: &WorkerDescriptor) -> f64 {
        let latency_score = (1.0 - worker.response_time_ms / RESPONSE_TIME_CEILING_MS).max(0.0);
        0.4 * worker.success_rate() + 0.4 * (1.0 - worker.load) + 0.2 * latency_score
    }
}

impl SelectionStrategy for HealthBased {
    fn select(&self, candidates: &[WorkerDescriptor], _task_type: &str, _priority: u8) -> Option<String> {
        let mut best: Option<(&WorkerDescriptor, f64)> = None;
        for worker in candidates {
            let score = Self::score(worker);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((worker, score)),
            }
        }
        best.map(|(w, _)| w.worker_id.clone())
    }

    fn name(&self) -> &'static str {
        "health_based"
    }
}
