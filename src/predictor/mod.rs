// =============================================================================
// Predictor Gate — classifier capability with fallback and caching
// =============================================================================

mod cache;
mod heuristic;
mod subprocess;

pub use cache::CachingPredictor;
pub use heuristic::HeuristicPredictor;
pub use subprocess::SubprocessPredictor;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::model::FeatureVector;

/// Capability set a predictor implementation must provide. Implementations
/// never panic, but a failed scoring attempt (subprocess crash, deadline
/// exceeded, malformed output) is reported as `Err` rather than folded into
/// a bare `0.0` — a caller with a fallback (`CachingPredictor`) needs to be
/// able to tell "scored zero" from "didn't score at all".
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Score a feature vector. On success, always in `[0, 1]`.
    async fn predict(&self, features: FeatureVector) -> EngineResult<f64>;

    /// Approve iff the predictor scores the vector and clears `threshold`.
    /// A failed predict is treated as not-approved.
    async fn approve(&self, features: FeatureVector, threshold: f64) -> bool {
        matches!(self.predict(features).await, Ok(p) if p >= threshold)
    }

    /// Health check used to decide whether to route around this predictor.
    async fn health(&self) -> bool;
}

/// A stub predictor returning a fixed probability — used in tests and as a
/// placeholder wiring point before a real model is attached.
pub struct StubPredictor {
    pub probability: f64,
    pub healthy: bool,
}

impl StubPredictor {
    pub fn new(probability: f64) -> Self {
        Self { probability, healthy: true }
    }
}

#[async_trait]
impl Predictor for StubPredictor {
    async fn predict(&self, _features: FeatureVector) -> EngineResult<f64> {
        Ok(self.probability.clamp(0.0, 1.0))
    }

    async fn health(&self) -> bool {
        self.healthy
    }
}
