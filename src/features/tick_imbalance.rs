// =============================================================================
// Tick-direction imbalance — bounded FIFO of trade-to-trade signs
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;

struct Inner {
    signs: VecDeque<i8>,
    last_price: Option<f64>,
    sum: i64,
}

/// Thread-safe FIFO of up to `capacity` trade-direction signs for one symbol.
pub struct TickImbalanceState {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl TickImbalanceState {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner { signs: VecDeque::new(), last_price: None, sum: 0 }),
            capacity: capacity.max(1),
        }
    }

    /// Record a trade price. The first trade for a symbol establishes the
    /// baseline and contributes no sign.
    pub fn push_price(&self, price: f64) {
        if !price.is_finite() {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(prev) = inner.last_price {
            let sign: i8 = if price > prev {
                1
            } else if price < prev {
                -1
            } else {
                0
            };
            inner.sum += sign as i64;
            inner.signs.push_back(sign);
            while inner.signs.len() > self.capacity {
                if let Some(evicted) = inner.signs.pop_front() {
                    inner.sum -= evicted as i64;
                }
            }
        }
        inner.last_price = Some(price);
    }

    /// Mean sign over the buffered window; 0 when empty.
    pub fn ratio(&self) -> f64 {
        let inner = self.inner.read();
        if inner.signs.is_empty() {
            0.0
        } else {
            inner.sum as f64 / inner.signs.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().signs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ratio_is_zero() {
        let s = TickImbalanceState::new(10);
        assert_eq!(s.ratio(), 0.0);
    }

    #[test]
    fn first_trade_contributes_no_sign() {
        let s = TickImbalanceState::new(10);
        s.push_price(100.0);
        assert_eq!(s.len(), 0);
        assert_eq!(s.ratio(), 0.0);
    }

    #[test]
    fn all_up_ticks_ratio_one() {
        let s = TickImbalanceState::new(10);
        for p in [100.0, 101.0, 102.0, 103.0] {
            s.push_price(p);
        }
        assert_eq!(s.ratio(), 1.0);
    }

    #[test]
    fn only_last_n_signs_contribute() {
        let s = TickImbalanceState::new(3);
        // Two down-ticks then three up-ticks; buffer keeps the last 3 signs.
        for p in [100.0, 99.0, 98.0, 99.0, 100.0, 101.0] {
            s.push_price(p);
        }
        assert_eq!(s.len(), 3);
        assert_eq!(s.ratio(), 1.0);
    }

    #[test]
    fn ratio_within_bounds() {
        let s = TickImbalanceState::new(5);
        for p in [10.0, 9.0, 9.0, 11.0, 8.0, 12.0] {
            s.push_price(p);
        }
        assert!(s.ratio() >= -1.0 && s.ratio() <= 1.0);
    }
}
