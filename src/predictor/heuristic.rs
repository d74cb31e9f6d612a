// =============================================================================
// Heuristic Predictor — deterministic fallback, no external model
// =============================================================================

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::model::FeatureVector;

use super::Predictor;

/// Approves iff `|depthRatio| > 0.1 && |tickRatio| > threshold_h`. Used when
/// the model-backed predictor is unavailable or past its deadline.
pub struct HeuristicPredictor {
    pub threshold_h: f64,
}

impl HeuristicPredictor {
    pub fn new(threshold_h: f64) -> Self {
        Self { threshold_h }
    }
}

#[async_trait]
impl Predictor for HeuristicPredictor {
    async fn predict(&self, features: FeatureVector) -> EngineResult<f64> {
        Ok(if self.heuristic_approve(features) { 1.0 } else { 0.0 })
    }

    async fn approve(&self, features: FeatureVector, _threshold: f64) -> bool {
        self.heuristic_approve(features)
    }

    async fn health(&self) -> bool {
        true
    }
}

impl HeuristicPredictor {
    fn heuristic_approve(&self, features: FeatureVector) -> bool {
        features.depth_ratio.abs() > 0.1 && features.tick_ratio.abs() > self.threshold_h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(tick: f64, depth: f64) -> FeatureVector {
        FeatureVector { tick_ratio: tick, depth_ratio: depth, price_dist: 0.0 }
    }

    #[tokio::test]
    async fn approves_when_both_clear() {
        let p = HeuristicPredictor::new(0.3);
        assert!(p.approve(fv(0.5, 0.2), 0.5).await);
    }

    #[tokio::test]
    async fn rejects_when_depth_too_small() {
        let p = HeuristicPredictor::new(0.3);
        assert!(!p.approve(fv(0.5, 0.05), 0.5).await);
    }

    #[tokio::test]
    async fn rejects_when_tick_too_small() {
        let p = HeuristicPredictor::new(0.3);
        assert!(!p.approve(fv(0.1, 0.2), 0.5).await);
    }

    #[tokio::test]
    async fn always_healthy() {
        let p = HeuristicPredictor::new(0.3);
        assert!(p.health().await);
    }
}
