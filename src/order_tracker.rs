// =============================================================================
// Order Tracker — submission retries, timeout reaping, settlement cleanup
// =============================================================================
//
// Owns the lifecycle of every order the execution engine submits: retry with
// linear backoff on submission failure, a periodic monitor loop (grounded on
// the exit monitor's `tokio::time::interval` scan-and-mutate shape) that
// times out orders past their deadline and best-effort cancels them
// remotely, and reaps terminal orders some time after they settle so the map
// doesn't grow unbounded across a long session. All map mutations go through
// one lock so a timeout and an incoming fill notification can never race.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{OrderStatus, Side, TrackedOrder};

/// How long a terminal order stays in the map after settling, for dashboard
/// visibility, before being reaped.
const REAP_AFTER: Duration = Duration::from_secs(300);

/// Submission/cancellation surface the tracker needs from the exchange
/// client. Kept as a trait here (rather than depending on `exchange::Client`
/// directly) so the tracker can be unit tested against a stub.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    async fn submit_order(&self, symbol: &str, side: Side, qty: f64, order_type: &str, trade_side: &str) -> EngineResult<String>;
    async fn cancel_order(&self, symbol: &str, client_id: &str) -> EngineResult<()>;
}

pub struct OrderTrackerConfig {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub order_timeout: Duration,
    /// Interval at which the monitor loop scans for timed-out/reapable orders.
    pub status_check_interval: Duration,
}

impl Default for OrderTrackerConfig {
    fn default() -> Self {
        Self { max_retries: 3, retry_backoff: Duration::from_millis(500), order_timeout: Duration::from_secs(30), status_check_interval: Duration::from_secs(5) }
    }
}

pub struct OrderTracker {
    orders: RwLock<HashMap<String, TrackedOrder>>,
    config: OrderTrackerConfig,
}

impl OrderTracker {
    pub fn new(config: OrderTrackerConfig) -> Self {
        Self { orders: RwLock::new(HashMap::new()), config }
    }

    /// Submit an order with linear-backoff retry, registering a
    /// `TrackedOrder` once a client id comes back from the exchange.
    pub async fn submit<S: OrderSubmitter>(&self, submitter: &S, symbol: &str, side: Side, qty: f64, order_type: &str, trade_side: &str) -> EngineResult<String> {
        let mut attempt = 0u32;
        loop {
            match submitter.submit_order(symbol, side, qty, order_type, trade_side).await {
                Ok(client_id) => {
                    let now = Utc::now();
                    let order = TrackedOrder {
                        client_id: client_id.clone(),
                        symbol: symbol.to_string(),
                        side,
                        qty,
                        order_type: order_type.to_string(),
                        status: OrderStatus::Pending,
                        submitted_at: now,
                        timeout_at: now + chrono::Duration::from_std(self.config.order_timeout).unwrap_or_default(),
                        retry_count: attempt,
                        last_error: None,
                        settled_at: None,
                    };
                    info!(client_id = %client_id, symbol, %side, qty, attempt, "order submitted");
                    self.orders.write().insert(client_id.clone(), order);
                    metrics::counter!(crate::metrics::names::ORDERS_SUBMITTED_TOTAL).increment(1);
                    return Ok(client_id);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(symbol, attempt, error = %e, "order submission failed");
                    if attempt > self.config.max_retries {
                        error!(symbol, attempts = attempt, "order submission exhausted retries");
                        metrics::counter!(crate::metrics::names::ORDERS_FAILED_TOTAL).increment(1);
                        return Err(e);
                    }
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
            }
        }
    }

    /// Mark an order filled (or otherwise settled) by client id.
    pub fn mark_settled(&self, client_id: &str, status: OrderStatus) {
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(client_id) {
            order.status = status;
            order.settled_at = Some(Utc::now());
            debug!(client_id, %status, "order settled");
        }
    }

    pub fn get(&self, client_id: &str) -> Option<TrackedOrder> {
        self.orders.read().get(client_id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.orders.read().values().filter(|o| !o.status.is_terminal()).count()
    }

    pub fn snapshot(&self) -> Vec<TrackedOrder> {
        self.orders.read().values().cloned().collect()
    }

    /// One scan: time out pending orders whose deadline has passed (best
    /// effort remote cancel) and reap terminal orders old enough to drop.
    async fn scan_once<S: OrderSubmitter>(&self, submitter: &S) {
        let now = Utc::now();

        let to_timeout: Vec<(String, String)> = {
            let orders = self.orders.read();
            orders
                .values()
                .filter(|o| o.status == OrderStatus::Pending && o.timeout_at <= now)
                .map(|o| (o.client_id.clone(), o.symbol.clone()))
                .collect()
        };

        for (client_id, symbol) in to_timeout {
            if let Err(e) = submitter.cancel_order(&symbol, &client_id).await {
                warn!(client_id, symbol, error = %e, "best-effort cancel on timeout failed");
            }
            let mut orders = self.orders.write();
            if let Some(order) = orders.get_mut(&client_id) {
                if order.status == OrderStatus::Pending {
                    order.status = OrderStatus::Timeout;
                    order.settled_at = Some(now);
                    warn!(client_id, symbol, "order timed out — cancelled");
                    metrics::counter!(crate::metrics::names::ORDERS_TIMED_OUT_TOTAL).increment(1);
                }
            }
        }

        let to_reap: Vec<String> = {
            let orders = self.orders.read();
            orders
                .values()
                .filter(|o| o.status.is_terminal())
                .filter(|o| o.settled_at.map(|t| now.signed_duration_since(t).to_std().unwrap_or_default() >= REAP_AFTER).unwrap_or(false))
                .map(|o| o.client_id.clone())
                .collect()
        };

        if !to_reap.is_empty() {
            let mut orders = self.orders.write();
            for client_id in &to_reap {
                orders.remove(client_id);
            }
            debug!(count = to_reap.len(), "reaped settled orders");
        }
    }

    /// Run the monitor loop forever. Spawn once at engine startup.
    pub async fn run_monitor<S: OrderSubmitter>(self: Arc<Self>, submitter: Arc<S>, shutdown: tokio_util::sync::CancellationToken) {
        info!(interval = ?self.config.status_check_interval, "order tracker monitor started");
        let mut ticker = interval(self.config.status_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan_once(submitter.as_ref()).await;
                }
                _ = shutdown.cancelled() => {
                    info!("order tracker monitor shutting down");
                    break;
                }
            }
        }
    }
}

fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<OrderTracker>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySubmitter {
        fail_times: AtomicU32,
        cancels: AtomicU32,
    }

    #[async_trait]
    impl OrderSubmitter for FlakySubmitter {
        async fn submit_order(&self, _symbol: &str, _side: Side, _qty: f64, _order_type: &str, _trade_side: &str) -> EngineResult<String> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::ConnectionLost("boom".into()));
            }
            Ok(uuid::Uuid::new_v4().to_string())
        }

        async fn cancel_order(&self, _symbol: &str, _client_id: &str) -> EngineResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn submit_retries_then_succeeds() {
        let tracker = OrderTracker::new(OrderTrackerConfig { retry_backoff: Duration::from_millis(1), ..Default::default() });
        let submitter = FlakySubmitter { fail_times: AtomicU32::new(2), cancels: AtomicU32::new(0) };
        let id = tracker.submit(&submitter, "BTCUSDT", Side::Long, 1.0, "market", "OPEN").await.unwrap();
        assert!(tracker.get(&id).is_some());
    }

    #[tokio::test]
    async fn submit_exhausts_retries_and_fails() {
        let tracker = OrderTracker::new(OrderTrackerConfig { max_retries: 2, retry_backoff: Duration::from_millis(1), ..Default::default() });
        let submitter = FlakySubmitter { fail_times: AtomicU32::new(10), cancels: AtomicU32::new(0) };
        let result = tracker.submit(&submitter, "BTCUSDT", Side::Long, 1.0, "market", "OPEN").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn scan_times_out_stale_pending_order() {
        let tracker = OrderTracker::new(OrderTrackerConfig { order_timeout: Duration::from_millis(1), ..Default::default() });
        let submitter = FlakySubmitter { fail_times: AtomicU32::new(0), cancels: AtomicU32::new(0) };
        let id = tracker.submit(&submitter, "BTCUSDT", Side::Long, 1.0, "market", "OPEN").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        tracker.scan_once(&submitter).await;
        let order = tracker.get(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Timeout);
        assert_eq!(submitter.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mark_settled_updates_status() {
        let tracker = OrderTracker::new(OrderTrackerConfig::default());
        let submitter = FlakySubmitter { fail_times: AtomicU32::new(0), cancels: AtomicU32::new(0) };
        let id = tracker.submit(&submitter, "ETHUSDT", Side::Short, 2.0, "market", "OPEN").await.unwrap();
        tracker.mark_settled(&id, OrderStatus::Filled);
        assert_eq!(tracker.get(&id).unwrap().status, OrderStatus::Filled);
        assert_eq!(tracker.pending_count(), 0);
    }
}
