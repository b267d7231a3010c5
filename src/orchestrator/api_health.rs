//! Upstream API success-rate feed used as the snapshot's `api_health`.

use async_trait::async_trait;

#[async_trait]
pub trait ApiHealthSource: Send + Sync {
    /// Score in [0, 1]; values outside the range are clamped by the caller
    async fn api_health(&self) -> f64;

    fn name(&self) -> &str {
        "api_health"
    }
}

/// Fixed score; defaults to fully healthy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticApiHealth {
    score: f64,
}

impl StaticApiHealth {
    pub fn new(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
        }
    }
}

impl Default for StaticApiHealth {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl ApiHealthSource for StaticApiHealth {
    async fn api_health(&self) -> f64 {
        self.score
    }

    fn name(&self) -> &str {
        "static"
    }
}
