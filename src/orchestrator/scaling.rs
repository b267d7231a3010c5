//! # Worker Scaling
//!
//! Load-driven scaling recommendations for the worker pool. The engine only
//! recommends; a [`WorkerScaler`] carries the decision out.

use crate::config::LoadBalancingConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ScalingDecision {
    ScaleUp { count: usize },
    ScaleDown { count: usize },
    NoChange,
}

#[derive(Debug, Clone)]
pub struct ScalingEngine {
    enabled: bool,
    scale_up_threshold: f64,
    scale_down_threshold: f64,
    min_workers: usize,
    max_workers: usize,
}

impl ScalingEngine {
    pub fn new(config: &LoadBalancingConfig) -> Self {
        info!(
            enabled = config.auto_scale,
            scale_up_threshold = config.scale_up_threshold,
            scale_down_threshold = config.scale_down_threshold,
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            "🎛️ SCALING: Engine created"
        );
        Self {
            enabled: config.auto_scale,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            min_workers: config.min_workers as usize,
            max_workers: config.max_workers as usize,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Recommend a change from the serving pool's mean load
    ///
    /// `average_load` is `None` when no worker is serving.
    pub fn evaluate(&self, average_load: Option<f64>, current_workers: usize) -> ScalingDecision {
        if !self.enabled {
            return ScalingDecision::NoChange;
        }

        if current_workers < self.min_workers {
            return ScalingDecision::ScaleUp {
                count: self.min_workers - current_workers,
            };
        }
        if current_workers > self.max_workers {
            return ScalingDecision::ScaleDown {
                count: current_workers - self.max_workers,
            };
        }

        let Some(load) = average_load else {
            return ScalingDecision::NoChange;
        };
        debug!(load, current_workers, "SCALING: Evaluating pool");

        if load > self.scale_up_threshold {
            if current_workers >= self.max_workers {
                warn!(
                    load,
                    max_workers = self.max_workers,
                    "SCALING: Pool at max size under high load"
                );
                return ScalingDecision::NoChange;
            }
            // Grow in proportion to how far load overshoots the threshold
            let target =
                ((current_workers.max(1) as f64) * load / self.scale_up_threshold).ceil() as usize;
            let count = target
                .saturating_sub(current_workers)
                .max(1)
                .min(self.max_workers - current_workers);
            return ScalingDecision::ScaleUp { count };
        }

        if load < self.scale_down_threshold && current_workers > self.min_workers {
            let count = ((current_workers - self.min_workers) / 2).max(1);
            return ScalingDecision::ScaleDown { count };
        }

        ScalingDecision::NoChange
    }
}

/// Carries out scaling decisions against the worker runtime
#[async_trait]
pub trait WorkerScaler: Send + Sync {
    async fn apply(&self, decision: ScalingDecision) -> Result<()>;

    fn name(&self) -> &str {
        "worker_scaler"
    }
}

/// Logs decisions and changes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWorkerScaler;

#[async_trait]
impl WorkerScaler for NullWorkerScaler {
    async fn apply(&self, decision: ScalingDecision) -> Result<()> {
        info!(decision = ?decision, "SCALING: No scaler wired, decision not applied");
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}
