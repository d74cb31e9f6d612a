// =============================================================================
// VWAP + rolling sigma — per-symbol volume-weighted price engine
// =============================================================================
//
// Mirrors the bounded-ring-buffer-behind-a-lock shape used for candle storage:
// a fixed-capacity `VecDeque` of samples, oldest evicted on overflow and
// returned to a small freelist so the hot path avoids churn through the
// allocator under steady trade flow.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;

/// A single volume-weighted price sample.
#[derive(Debug, Clone, Copy)]
struct Sample {
    price: f64,
    volume: f64,
    ts: DateTime<Utc>,
}

struct Inner {
    samples: VecDeque<Sample>,
    /// Evicted sample slots, reused to avoid reallocating `Sample` storage.
    freelist: Vec<Sample>,
}

/// Thread-safe VWAP + rolling standard deviation engine for one symbol.
pub struct VwapState {
    inner: RwLock<Inner>,
    capacity: usize,
    window: ChronoDuration,
}

impl VwapState {
    /// `capacity` bounds the ring buffer; `window` bounds the time horizon
    /// used when computing VWAP/sigma (expired samples are excluded but not
    /// necessarily evicted from the ring until capacity forces it).
    pub fn new(capacity: usize, window: std::time::Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                samples: VecDeque::with_capacity(capacity),
                freelist: Vec::new(),
            }),
            capacity: capacity.max(1),
            window: ChronoDuration::from_std(window).unwrap_or(ChronoDuration::seconds(60)),
        }
    }

    /// Push a new `(price, volume)` sample observed at `now`. Invalid input
    /// (non-finite or negative) is rejected silently — the caller counts the
    /// rejection as a feature error.
    pub fn push(&self, price: f64, volume: f64, now: DateTime<Utc>) -> bool {
        if !price.is_finite() || !volume.is_finite() || price < 0.0 || volume < 0.0 {
            return false;
        }

        let mut inner = self.inner.write();
        let sample = match inner.freelist.pop() {
            Some(mut reused) => {
                reused.price = price;
                reused.volume = volume;
                reused.ts = now;
                reused
            }
            None => Sample { price, volume, ts: now },
        };
        inner.samples.push_back(sample);

        while inner.samples.len() > self.capacity {
            if let Some(evicted) = inner.samples.pop_front() {
                inner.freelist.push(evicted);
            }
        }
        true
    }

    /// Compute `(vwap, sigma)` over the in-window samples as of `now`.
    pub fn compute(&self, now: DateTime<Utc>) -> (f64, f64) {
        let inner = self.inner.read();
        let cutoff = now - self.window;

        let mut sum_pv = 0.0;
        let mut sum_v = 0.0;
        let mut in_window = 0usize;

        for s in inner.samples.iter().rev() {
            if s.ts <= cutoff {
                break;
            }
            sum_pv += s.price * s.volume;
            sum_v += s.volume;
            in_window += 1;
        }

        if sum_v == 0.0 {
            return (0.0, 0.0);
        }
        let mu = sum_pv / sum_v;
        if in_window < 1 {
            return (mu, 0.0);
        }

        let mut sum_var = 0.0;
        for s in inner.samples.iter().rev() {
            if s.ts <= cutoff {
                break;
            }
            let d = s.price - mu;
            sum_var += s.volume * d * d;
        }
        let variance = sum_var / sum_v;
        let sigma = if variance < 0.0 { 0.0 } else { variance.sqrt() };
        (mu, sigma)
    }

    pub fn len(&self) -> usize {
        self.inner.read().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn equal_prices_yield_zero_sigma() {
        let v = VwapState::new(1000, std::time::Duration::from_secs(60));
        for i in 0..10 {
            v.push(100.0, 1.0 + i as f64, t(i));
        }
        let (mu, sigma) = v.compute(t(9));
        assert!((mu - 100.0).abs() < 1e-9);
        assert!(sigma.abs() < 1e-9);
    }

    #[test]
    fn empty_state_yields_zero_zero() {
        let v = VwapState::new(10, std::time::Duration::from_secs(60));
        let (mu, sigma) = v.compute(t(0));
        assert_eq!(mu, 0.0);
        assert_eq!(sigma, 0.0);
    }

    #[test]
    fn rejects_invalid_samples() {
        let v = VwapState::new(10, std::time::Duration::from_secs(60));
        assert!(!v.push(f64::NAN, 1.0, t(0)));
        assert!(!v.push(100.0, -1.0, t(0)));
        assert_eq!(v.len(), 0);
    }

    #[test]
    fn warmup_scenario_matches_spec() {
        // 100 trades, prices 100..=199, volume 1 each, window 60s, size 600.
        let v = VwapState::new(600, std::time::Duration::from_secs(60));
        for i in 0..100i64 {
            v.push(100.0 + i as f64, 1.0, t(i));
        }
        let (mu, sigma) = v.compute(t(99));
        assert!((mu - 149.5).abs() < 1e-6);
        assert!((sigma - 28.8660).abs() < 1e-3);

        let price_dist = (160.0 - mu) / sigma;
        assert!((price_dist - 0.364).abs() < 1e-2);
    }

    #[test]
    fn overflow_evicts_oldest_and_reuses_storage() {
        let v = VwapState::new(5, std::time::Duration::from_secs(3600));
        for i in 0..10i64 {
            v.push(100.0 + i as f64, 1.0, t(i));
        }
        assert_eq!(v.len(), 5);
        let (mu, _) = v.compute(t(9));
        // Only the last 5 samples (prices 105..=109) remain.
        assert!((mu - 107.0).abs() < 1e-9);
    }

    #[test]
    fn expired_samples_excluded_from_window() {
        let v = VwapState::new(100, std::time::Duration::from_secs(10));
        v.push(100.0, 1.0, t(0));
        v.push(200.0, 1.0, t(20));
        let (mu, _) = v.compute(t(20));
        assert!((mu - 200.0).abs() < 1e-9);
    }
}
