// =============================================================================
// Execution Engine — mean-reversion sizing, risk gate, per-symbol locking
// =============================================================================
//
// One engine ties the exchange client, position manager, and risk engine
// together, with a demo/dry-run path alongside the live path. Direction
// comes from the sign of the price's z-score distance
// from its VWAP (mean reversion — below the mean expects a bounce up, above
// it expects a pullback), and size comes from a risk budget rather than a
// caller-supplied quantity.
//
// Per-symbol execution is serialized with one `tokio::sync::Mutex` per
// symbol so two depth events for the same symbol can never race into two
// simultaneous submissions — the open-position check and the submission
// that follows it need to be atomic with respect to each other, but
// different symbols must not block one another.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::exchange::ExchangeClient;
use crate::model::Side;
use crate::order_tracker::OrderTracker;
use crate::position_engine::PositionManager;
use crate::risk::RiskEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// Order submitted to the exchange (live mode).
    Placed(String),
    /// Order simulated locally (dry-run mode).
    Simulated(String),
    /// Blocked by the risk engine, an existing position, or a flat signal.
    Blocked(String),
    /// Submission failed after retries.
    Error(String),
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placed(id) => write!(f, "Placed({id})"),
            Self::Simulated(msg) => write!(f, "Simulated({msg})"),
            Self::Blocked(reason) => write!(f, "Blocked({reason})"),
            Self::Error(err) => write!(f, "Error({err})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Fraction of account balance risked per trade (e.g. 0.01 = 1 %).
    pub account_risk: f64,
    /// Stop distance as a multiple of sigma.
    pub stop_multiplier: f64,
    /// Take-profit distance as a multiple of the stop distance.
    pub reward_multiple: f64,
    /// Hard ceiling on position size regardless of the risk budget.
    pub max_position_size: f64,
    /// Flat commission applied on close, in quote currency.
    pub commission: f64,
    /// When true, orders are simulated locally and never sent to the exchange.
    pub dry_run: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { account_risk: 0.01, stop_multiplier: 2.0, reward_multiple: 1.5, max_position_size: 1.0, commission: 0.0, dry_run: true }
    }
}

pub struct ExecutionEngine {
    pub client: Arc<ExchangeClient>,
    pub order_tracker: Arc<OrderTracker>,
    pub position_manager: Arc<PositionManager>,
    pub risk_engine: Arc<RiskEngine>,
    config: ExecutionConfig,
    symbol_locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ExecutionEngine {
    pub fn new(client: Arc<ExchangeClient>, order_tracker: Arc<OrderTracker>, position_manager: Arc<PositionManager>, risk_engine: Arc<RiskEngine>, config: ExecutionConfig) -> Self {
        Self { client, order_tracker, position_manager, risk_engine, config, symbol_locks: RwLock::new(HashMap::new()) }
    }

    /// Flat commission configured for the engine, read by the orchestrator
    /// when closing positions so `balance += pnl` already nets it out.
    pub fn commission(&self) -> f64 {
        self.config.commission
    }

    fn lock_for(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.symbol_locks.read().get(symbol) {
            return Arc::clone(lock);
        }
        let mut locks = self.symbol_locks.write();
        Arc::clone(locks.entry(symbol.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }

    /// Evaluate a mean-reversion signal and, if approved, size and submit an
    /// order. `price_dist` is the price's z-score distance from VWAP;
    /// `sigma` is the volume-weighted standard deviation used to size the
    /// stop. Held under a per-symbol lock for the duration of the decision.
    pub async fn evaluate_and_execute(&self, symbol: &str, mid_price: f64, price_dist: f64, sigma: f64, balance: f64) -> ExecutionResult {
        let lock = self.lock_for(symbol);
        let _guard = lock.lock().await;

        if self.position_manager.has_open_position(symbol) {
            return ExecutionResult::Blocked("position already open for symbol".to_string());
        }

        let (allowed, reason) = self.risk_engine.can_trade();
        if !allowed {
            let msg = reason.unwrap_or_else(|| "unknown risk violation".to_string());
            warn!(symbol, reason = %msg, "execution blocked by risk engine");
            return ExecutionResult::Blocked(msg);
        }

        if !sigma.is_finite() || sigma <= 0.0 {
            return ExecutionResult::Blocked("no volatility estimate yet".to_string());
        }
        if price_dist == 0.0 {
            return ExecutionResult::Blocked("flat signal".to_string());
        }

        // Mean reversion: price below VWAP expects a bounce up (long);
        // above it expects a pullback (short).
        let side = if price_dist < 0.0 { Side::Long } else { Side::Short };

        let stop_distance = sigma * self.config.stop_multiplier;
        if stop_distance <= 0.0 {
            return ExecutionResult::Blocked("non-positive stop distance".to_string());
        }

        let size = (balance * self.config.account_risk / stop_distance).min(balance * self.config.max_position_size / mid_price);
        if !size.is_finite() || size <= 0.0 {
            return ExecutionResult::Blocked("computed size non-positive".to_string());
        }

        let (stop_loss, take_profit) = match side {
            Side::Long => (mid_price - stop_distance, mid_price + stop_distance * self.config.reward_multiple),
            Side::Short => (mid_price + stop_distance, mid_price - stop_distance * self.config.reward_multiple),
        };

        info!(symbol, %side, mid_price, size, stop_loss, take_profit, dry_run = self.config.dry_run, "execution decision");

        if self.config.dry_run {
            return self.execute_dry_run(symbol, side, mid_price, size, stop_loss, take_profit);
        }

        self.execute_live(symbol, side, mid_price, size, stop_loss, take_profit).await
    }

    fn execute_dry_run(&self, symbol: &str, side: Side, price: f64, size: f64, stop_loss: f64, take_profit: f64) -> ExecutionResult {
        let position_id = self.position_manager.open_position(symbol, side, price, size, stop_loss, take_profit);
        let msg = format!("dry-run fill: symbol={symbol} side={side} price={price} size={size} position_id={position_id}");
        info!("{}", msg);
        ExecutionResult::Simulated(msg)
    }

    async fn execute_live(&self, symbol: &str, side: Side, price: f64, size: f64, stop_loss: f64, take_profit: f64) -> ExecutionResult {
        match self.order_tracker.submit(self.client.as_ref(), symbol, side, size, "MARKET", "OPEN").await {
            Ok(client_id) => {
                self.risk_engine.breaker.record_success();
                let position_id = self.position_manager.open_position(symbol, side, price, size, stop_loss, take_profit);
                info!(symbol, %side, position_id = %position_id, client_id = %client_id, "live order placed and position opened");
                ExecutionResult::Placed(client_id)
            }
            Err(e) => {
                self.risk_engine.breaker.record_failure("order_submission");
                warn!(symbol, %side, error = %e, "live order placement failed");
                ExecutionResult::Error(format!("order placement failed: {e}"))
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("client", &"<ExchangeClient>")
            .field("position_manager", &self.position_manager)
            .field("risk_engine", &self.risk_engine)
            .field("dry_run", &self.config.dry_run)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_tracker::OrderTrackerConfig;
    use crate::risk::CircuitBreakerConfig;

    fn engine(dry_run: bool) -> ExecutionEngine {
        let client = Arc::new(ExchangeClient::new("key", "secret", "https://example.invalid"));
        let order_tracker = Arc::new(OrderTracker::new(OrderTrackerConfig::default()));
        let position_manager = Arc::new(PositionManager::new());
        let risk_engine = Arc::new(RiskEngine::new(10_000.0, 0.05, 0.5, CircuitBreakerConfig::default()));
        ExecutionEngine::new(client, order_tracker, position_manager, risk_engine, ExecutionConfig { dry_run, ..Default::default() })
    }

    #[tokio::test]
    async fn negative_price_dist_opens_long_in_dry_run() {
        let engine = engine(true);
        let result = engine.evaluate_and_execute("BTCUSDT", 100.0, -1.5, 2.0, 10_000.0).await;
        assert!(matches!(result, ExecutionResult::Simulated(_)));
        let open = engine.position_manager.get_open_positions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Long);
    }

    #[tokio::test]
    async fn positive_price_dist_opens_short_in_dry_run() {
        let engine = engine(true);
        let result = engine.evaluate_and_execute("BTCUSDT", 100.0, 1.5, 2.0, 10_000.0).await;
        assert!(matches!(result, ExecutionResult::Simulated(_)));
        let open = engine.position_manager.get_open_positions();
        assert_eq!(open[0].side, Side::Short);
    }

    #[tokio::test]
    async fn blocks_when_position_already_open() {
        let engine = engine(true);
        engine.evaluate_and_execute("BTCUSDT", 100.0, -1.0, 2.0, 10_000.0).await;
        let second = engine.evaluate_and_execute("BTCUSDT", 101.0, -1.0, 2.0, 10_000.0).await;
        assert!(matches!(second, ExecutionResult::Blocked(_)));
    }

    #[tokio::test]
    async fn blocks_on_zero_sigma() {
        let engine = engine(true);
        let result = engine.evaluate_and_execute("BTCUSDT", 100.0, -1.0, 0.0, 10_000.0).await;
        assert!(matches!(result, ExecutionResult::Blocked(_)));
    }

    #[tokio::test]
    async fn blocks_when_risk_engine_killed() {
        let engine = engine(true);
        engine.risk_engine.kill();
        let result = engine.evaluate_and_execute("BTCUSDT", 100.0, -1.0, 2.0, 10_000.0).await;
        assert!(matches!(result, ExecutionResult::Blocked(_)));
    }

    #[tokio::test]
    async fn size_is_capped_by_notional_max_position_size() {
        // balance=10_000, stopDistance=15 (sigma=7.5, stop_multiplier=2.0),
        // maxPositionSize=0.01, price=120 -> risk-budget size 6.667 capped to
        // notional cap 0.833.
        let client = Arc::new(ExchangeClient::new("key", "secret", "https://example.invalid"));
        let order_tracker = Arc::new(OrderTracker::new(OrderTrackerConfig::default()));
        let position_manager = Arc::new(PositionManager::new());
        let risk_engine = Arc::new(RiskEngine::new(10_000.0, 0.5, 0.5, CircuitBreakerConfig::default()));
        let engine = ExecutionEngine::new(client, order_tracker, position_manager, risk_engine, ExecutionConfig { dry_run: true, max_position_size: 0.01, ..Default::default() });
        engine.evaluate_and_execute("BTCUSDT", 120.0, -1.0, 7.5, 10_000.0).await;
        let open = engine.position_manager.get_open_positions();
        assert!((open[0].size - 0.8333333333333334).abs() < 1e-9);
    }
}
