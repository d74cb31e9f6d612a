// =============================================================================
// Rate-Limit Tracker — monitors REST usage to avoid 429s
// =============================================================================
//
// The venue returns a used-weight header on every response; the tracker
// keeps atomic counters any thread may query lock-free, and a pre-flight
// check before submitting an order.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

const WEIGHT_HARD_LIMIT: u32 = 1000;
const WEIGHT_WARN_THRESHOLD: u32 = 800;

const ORDER_10S_LIMIT: u32 = 10;
const ORDER_1D_LIMIT: u32 = 200_000;

pub struct RateLimiter {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1d: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(val) = headers.get("X-RateLimit-Used-Weight-1M") {
            if let Ok(s) = val.to_str() {
                if let Ok(w) = s.parse::<u32>() {
                    let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
                    if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                        warn!(used_weight = w, hard_limit = WEIGHT_HARD_LIMIT, "rate-limit weight crossed warning threshold");
                    } else if w >= WEIGHT_WARN_THRESHOLD {
                        warn!(used_weight = w, "rate-limit weight remains above warning threshold");
                    }
                    debug!(used_weight_1m = w, "rate-limit weight updated from header");
                }
            }
        }

        if let Some(val) = headers.get("X-RateLimit-Order-Count-10S") {
            if let Ok(s) = val.to_str() {
                if let Ok(c) = s.parse::<u32>() {
                    self.order_count_10s.store(c, Ordering::Relaxed);
                }
            }
        }

        if let Some(val) = headers.get("X-RateLimit-Order-Count-1D") {
            if let Ok(s) = val.to_str() {
                if let Ok(c) = s.parse::<u32>() {
                    self.order_count_1d.store(c, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(current_weight = current, requested_weight = weight, hard_limit = WEIGHT_HARD_LIMIT, "request blocked — would exceed rate-limit");
        }
        allowed
    }

    pub fn can_place_order(&self) -> bool {
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        let count_1d = self.order_count_1d.load(Ordering::Relaxed);

        if count_10s >= ORDER_10S_LIMIT {
            warn!(count_10s, limit = ORDER_10S_LIMIT, "order blocked — 10 s order limit reached");
            return false;
        }
        if count_1d >= ORDER_1D_LIMIT {
            warn!(count_1d, limit = ORDER_1D_LIMIT, "order blocked — daily order limit reached");
            return false;
        }
        true
    }

    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_10s_counter(&self) {
        self.order_count_10s.store(0, Ordering::Relaxed);
    }

    pub fn reset_1m_weight(&self) {
        self.used_weight_1m.store(0, Ordering::Relaxed);
    }

    pub fn reset_daily_counter(&self) {
        self.order_count_1d.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("order_count_10s", &self.order_count_10s.load(Ordering::Relaxed))
            .field("order_count_1d", &self.order_count_1d.load(Ordering::Relaxed))
            .finish()
    }
}
