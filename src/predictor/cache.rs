// =============================================================================
// Caching Predictor — TTL cache over an inner predictor, with fallback
// =============================================================================
//
// Wraps an inner predictor (normally the subprocess-backed model) and a
// fallback (normally the heuristic). Caches `(fingerprint -> probability)`
// for a short TTL to absorb duplicate feature vectors within a burst of
// depth events, and routes to the fallback whenever the inner predictor's
// health check fails. Grounded on the half-life/TTL bookkeeping idiom used
// for signal decay: a timestamped map, swept lazily on read.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::EngineResult;
use crate::model::FeatureVector;

use super::Predictor;

struct CacheEntry {
    probability: f64,
    inserted_at: Instant,
}

/// Decimal precision used when fingerprinting a feature vector for caching.
const FINGERPRINT_DECIMALS: u32 = 4;

pub struct CachingPredictor<I: Predictor, F: Predictor> {
    inner: I,
    fallback: F,
    ttl: Duration,
    cache: RwLock<HashMap<(i64, i64, i64), CacheEntry>>,
    fallback_uses: AtomicU64,
    timeouts: AtomicU64,
}

impl<I: Predictor, F: Predictor> CachingPredictor<I, F> {
    pub fn new(inner: I, fallback: F, ttl: Duration) -> Self {
        Self {
            inner,
            fallback,
            ttl,
            cache: RwLock::new(HashMap::new()),
            fallback_uses: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn fallback_use_count(&self) -> u64 {
        self.fallback_uses.load(Ordering::Relaxed)
    }

    fn cached(&self, key: (i64, i64, i64)) -> Option<f64> {
        let cache = self.cache.read();
        cache.get(&key).and_then(|e| {
            if e.inserted_at.elapsed() <= self.ttl {
                Some(e.probability)
            } else {
                None
            }
        })
    }

    fn insert(&self, key: (i64, i64, i64), probability: f64) {
        let mut cache = self.cache.write();
        cache.insert(key, CacheEntry { probability, inserted_at: Instant::now() });
        // Opportunistic sweep so the map doesn't grow unbounded across a
        // long-running session.
        let ttl = self.ttl;
        cache.retain(|_, v| v.inserted_at.elapsed() <= ttl * 4);
    }
}

#[async_trait]
impl<I: Predictor, F: Predictor> Predictor for CachingPredictor<I, F> {
    async fn predict(&self, features: FeatureVector) -> EngineResult<f64> {
        let key = features.fingerprint(FINGERPRINT_DECIMALS);
        if let Some(p) = self.cached(key) {
            return Ok(p);
        }

        if !self.inner.health().await {
            self.fallback_uses.fetch_add(1, Ordering::Relaxed);
            return self.fallback.predict(features).await;
        }

        match self.inner.predict(features).await {
            Ok(prob) => {
                self.insert(key, prob);
                Ok(prob)
            }
            Err(e) => {
                self.fallback_uses.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "inner predictor failed on a healthy check — falling back");
                self.fallback.predict(features).await
            }
        }
    }

    async fn health(&self) -> bool {
        // The caching layer is always "healthy" from the caller's point of
        // view — it degrades to the fallback internally rather than failing.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::predictor::{HeuristicPredictor, StubPredictor};

    fn fv(tick: f64, depth: f64, dist: f64) -> FeatureVector {
        FeatureVector { tick_ratio: tick, depth_ratio: depth, price_dist: dist }
    }

    /// Reports healthy but fails every `predict` call — the case a bare
    /// health check alone can't catch.
    struct FailsOnPredict;

    #[async_trait]
    impl Predictor for FailsOnPredict {
        async fn predict(&self, _features: FeatureVector) -> EngineResult<f64> {
            Err(EngineError::PredictorUnavailable("boom".into()))
        }

        async fn health(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn identical_inputs_return_same_probability_within_ttl() {
        let cp = CachingPredictor::new(StubPredictor::new(0.77), HeuristicPredictor::new(0.3), Duration::from_secs(5));
        let a = cp.predict(fv(0.5, 0.5, 1.0)).await.unwrap();
        let b = cp.predict(fv(0.5, 0.5, 1.0)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 0.77);
    }

    #[tokio::test]
    async fn falls_back_when_inner_unhealthy() {
        let unhealthy = StubPredictor { probability: 0.9, healthy: false };
        let cp = CachingPredictor::new(unhealthy, HeuristicPredictor::new(0.3), Duration::from_secs(5));
        // Heuristic approves at tick 0.5 depth 0.5 -> predict returns 1.0.
        let p = cp.predict(fv(0.5, 0.5, 0.0)).await.unwrap();
        assert_eq!(p, 1.0);
        assert_eq!(cp.fallback_use_count(), 1);
    }

    #[tokio::test]
    async fn falls_back_when_healthy_inner_still_fails_to_predict() {
        let cp = CachingPredictor::new(FailsOnPredict, HeuristicPredictor::new(0.3), Duration::from_secs(5));
        // Heuristic approves at tick 0.5 depth 0.5 -> predict returns 1.0.
        let p = cp.predict(fv(0.5, 0.5, 0.0)).await.unwrap();
        assert_eq!(p, 1.0);
        assert_eq!(cp.fallback_use_count(), 1);
    }
}
