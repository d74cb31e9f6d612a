// =============================================================================
// Orchestrator — wires the stream transport to features, the predictor gate,
// and execution; runs the exit-scanning and liveness-watchdog loops
// =============================================================================
//
// Three long-running tasks, spawned together and torn down together on
// `CancellationToken` cancellation:
//   1. Event loop — consumes `StreamEvent`s, updates per-symbol feature
//      state, and on a depth tick asks the predictor gate whether to trade.
//   2. Exit monitor — periodically scans open positions for stop-loss,
//      take-profit, and timeout exits.
//   3. Liveness watchdog — mirrors the stream handle's last-event timestamp
//      and drop counter onto `AppState` for the dashboard.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::execution::ExecutionEngine;
use crate::features::{depth_imbalance, TickImbalanceState, VwapState};
use crate::model::{ExitReason, FeatureVector};
use crate::order_tracker::OrderTracker;
use crate::persistence::Persistence;
use crate::position_engine::PositionManager;
use crate::predictor::Predictor;
use crate::risk::RiskEngine;
use crate::stream::{StreamConfig, StreamEvent, StreamTransport};

const MAX_HOLDING_SECS: i64 = 3600;
const EXIT_SCAN_INTERVAL_SECS: u64 = 5;
const MAX_STREAM_STALENESS_SECS: i64 = 30;

struct SymbolFeatures {
    vwap: Arc<VwapState>,
    tick: Arc<TickImbalanceState>,
}

pub struct Orchestrator {
    config: Config,
    execution: Arc<ExecutionEngine>,
    position_manager: Arc<PositionManager>,
    order_tracker: Arc<OrderTracker>,
    risk_engine: Arc<RiskEngine>,
    predictor: Arc<dyn Predictor>,
    persistence: Arc<dyn Persistence>,
    app_state: Arc<AppState>,
    features: RwLock<HashMap<String, SymbolFeatures>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        execution: Arc<ExecutionEngine>,
        position_manager: Arc<PositionManager>,
        order_tracker: Arc<OrderTracker>,
        risk_engine: Arc<RiskEngine>,
        predictor: Arc<dyn Predictor>,
        persistence: Arc<dyn Persistence>,
        app_state: Arc<AppState>,
    ) -> Self {
        let mut features = HashMap::new();
        for symbol in &config.symbols {
            features.insert(
                symbol.clone(),
                SymbolFeatures {
                    vwap: Arc::new(VwapState::new(config.vwap_size, std::time::Duration::from_secs(config.vwap_window_secs))),
                    tick: Arc::new(TickImbalanceState::new(config.tick_size)),
                },
            );
        }
        Self { config, execution, position_manager, order_tracker, risk_engine, predictor, persistence, app_state, features: RwLock::new(features) }
    }

    pub fn spawn(self: Arc<Self>, client: Arc<ExchangeClient>, shutdown: CancellationToken) {
        let stream_config = StreamConfig { ws_url: self.config.ws_url.clone(), symbols: self.config.symbols.clone(), ping_interval: std::time::Duration::from_secs(self.config.ping_interval_secs) };
        let handle = StreamTransport::spawn(stream_config, shutdown.clone());
        let (handle_last_event_ms, handle_dropped) = handle.liveness_handles();

        let last_event_ms = self.app_state.stream_last_event_ms.clone();
        let dropped = self.app_state.stream_dropped.clone();

        let event_loop_self = self.clone();
        let mut events = handle.events;
        let event_loop_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = events.recv() => {
                        match maybe_event {
                            Some(event) => event_loop_self.handle_event(&client, event).await,
                            None => {
                                warn!("stream event channel closed — event loop exiting");
                                break;
                            }
                        }
                    }
                    _ = event_loop_shutdown.cancelled() => {
                        info!("orchestrator event loop shutting down");
                        break;
                    }
                }
            }
        });

        let watchdog_shutdown = shutdown.clone();
        let watchdog_self = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let last = handle_last_event_ms.load(Ordering::Relaxed);
                        last_event_ms.store(last, Ordering::Relaxed);
                        dropped.store(handle_dropped.load(Ordering::Relaxed), Ordering::Relaxed);
                        watchdog_self.report_gauges(last);
                    }
                    _ = watchdog_shutdown.cancelled() => break,
                }
            }
        });

        let exit_self = self.clone();
        let exit_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(EXIT_SCAN_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => exit_self.scan_exits().await,
                    _ = exit_shutdown.cancelled() => {
                        info!("exit monitor shutting down");
                        break;
                    }
                }
            }
        });
    }

    async fn handle_event(&self, client: &Arc<ExchangeClient>, event: StreamEvent) {
        match event {
            StreamEvent::Trade(trade) => {
                let features = self.features.read();
                if let Some(f) = features.get(&trade.symbol) {
                    f.vwap.push(trade.price, trade.qty, trade.ts);
                    f.tick.push_price(trade.price);
                }
            }
            StreamEvent::Depth(depth) => {
                self.on_depth(client, &depth).await;
            }
        }
    }

    async fn on_depth(&self, client: &Arc<ExchangeClient>, depth: &crate::model::Depth) {
        self.persistence.store_depth(depth).await;

        if self.position_manager.has_open_position(&depth.symbol) {
            self.position_manager.update_price(&depth.symbol, depth.mid_price);
            return;
        }

        let (vwap, sigma, tick_ratio) = {
            let features = self.features.read();
            let Some(f) = features.get(&depth.symbol) else { return };
            let (vwap, sigma) = f.vwap.compute(depth.ts);
            (vwap, sigma, f.tick.ratio())
        };

        if sigma <= 0.0 || vwap <= 0.0 {
            return;
        }

        let price_dist = (depth.mid_price - vwap) / sigma;
        let depth_ratio = depth_imbalance(depth.bid_vol, depth.ask_vol);

        let fv = FeatureVector { tick_ratio, depth_ratio, price_dist };
        if !fv.is_finite() {
            return;
        }

        let predict_started = std::time::Instant::now();
        let approved = self.predictor.approve(fv, self.config.prob_threshold).await;
        metrics::histogram!(crate::metrics::names::PREDICT_LATENCY_SECONDS).record(predict_started.elapsed().as_secs_f64());
        if !approved {
            return;
        }

        if price_dist.abs() > self.config.max_price_distance {
            return;
        }

        let balance = self.execution_balance();
        let decision_started = std::time::Instant::now();
        let result = self.execution.evaluate_and_execute(&depth.symbol, depth.mid_price, price_dist, sigma, balance).await;
        metrics::histogram!(crate::metrics::names::DECISION_LATENCY_SECONDS).record(decision_started.elapsed().as_secs_f64());
        info!(symbol = %depth.symbol, %result, "orchestrator decision");

        // Market orders fill at submission time; there is no separate
        // fill-notification stream to wait on.
        if let crate::execution::ExecutionResult::Placed(client_id) = &result {
            self.order_tracker.mark_settled(client_id, crate::model::OrderStatus::Filled);
        }

        let _ = client;
    }

    fn execution_balance(&self) -> f64 {
        self.risk_engine.current_balance()
    }

    /// Refresh the dashboard/Prometheus gauges off the last-event timestamp
    /// the liveness watchdog already polled this tick.
    fn report_gauges(&self, last_event_ms: i64) {
        let open_positions = self.position_manager.get_open_positions().len();
        metrics::gauge!(crate::metrics::names::OPEN_POSITIONS).set(open_positions as f64);

        let state = self.risk_engine.get_state();
        metrics::gauge!(crate::metrics::names::DAILY_PNL).set(state.daily_pnl);
        let risk_mode_code = match state.risk_mode.as_str() {
            "Normal" => 0.0,
            "Cautious" => 1.0,
            _ => 2.0, // BREAKER_TRIPPED, KILLED
        };
        metrics::gauge!(crate::metrics::names::RISK_MODE).set(risk_mode_code);

        metrics::gauge!(crate::metrics::names::PENDING_ORDERS).set(self.order_tracker.pending_count() as f64);

        let staleness_ms = if last_event_ms == 0 { 0.0 } else { (Utc::now().timestamp_millis() - last_event_ms).max(0) as f64 };
        metrics::gauge!(crate::metrics::names::STREAM_STALENESS_MS).set(staleness_ms);
    }

    async fn scan_exits(&self) {
        let now = Utc::now();
        let exits = self.position_manager.check_exits(ChronoDuration::seconds(MAX_HOLDING_SECS), now);
        for (id, reason) in exits {
            let open = self.position_manager.get_open_positions();
            let Some(pos) = open.iter().find(|p| p.id == id) else { continue };
            let exit_price = pos.current_price;
            if let Some(record) = self.position_manager.close_position(&id, reason, exit_price, self.config_commission()) {
                self.risk_engine.record_trade_result(record.pnl);
                metrics::counter!(crate::metrics::names::TRADES_TOTAL).increment(1);
                self.persistence.store_trade(&record).await;
                self.app_state.increment_version();
                info!(symbol = %record.symbol, pnl = record.pnl, %reason, "position closed by exit monitor");
            }
        }
    }

    fn config_commission(&self) -> f64 {
        self.execution.commission()
    }

    /// Force-close every open position (used at shutdown).
    pub async fn close_all(&self, reason: ExitReason) {
        let records = self.position_manager.close_all(reason, |_symbol| None, self.config_commission());
        for record in &records {
            self.risk_engine.record_trade_result(record.pnl);
            self.persistence.store_trade(record).await;
        }
        if !records.is_empty() {
            info!(count = records.len(), "closed all open positions on shutdown");
        }
        self.persistence.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeClient;
    use crate::model::Side;
    use crate::order_tracker::OrderTrackerConfig;
    use crate::persistence::NullPersistence;
    use crate::predictor::StubPredictor;
    use crate::risk::CircuitBreakerConfig;

    fn orchestrator() -> Arc<Orchestrator> {
        let config = Config::default();
        let client = Arc::new(ExchangeClient::new("key", "secret", "https://example.invalid"));
        let order_tracker = Arc::new(OrderTracker::new(OrderTrackerConfig::default()));
        let position_manager = Arc::new(PositionManager::new());
        let risk_engine = Arc::new(RiskEngine::new(10_000.0, 0.05, 0.5, CircuitBreakerConfig::default()));
        let execution = Arc::new(ExecutionEngine::new(client.clone(), order_tracker.clone(), position_manager.clone(), risk_engine.clone(), crate::execution::ExecutionConfig::default()));
        let predictor: Arc<dyn Predictor> = Arc::new(StubPredictor::new(1.0));
        let persistence: Arc<dyn Persistence> = Arc::new(NullPersistence);
        let app_state = Arc::new(AppState::new(config.clone(), risk_engine.clone(), position_manager.clone(), order_tracker.clone()));
        Arc::new(Orchestrator::new(config, execution, position_manager, order_tracker, risk_engine, predictor, persistence, app_state))
    }

    #[tokio::test]
    async fn scan_exits_closes_positions_past_timeout() {
        let orch = orchestrator();
        orch.position_manager.open_position("BTCUSDT", Side::Long, 100.0, 1.0, 50.0, 150.0);
        // MAX_HOLDING_SECS is large, so force a timeout via a negative window.
        let exits = orch.position_manager.check_exits(ChronoDuration::seconds(-1), Utc::now());
        assert_eq!(exits.len(), 1);
    }

    #[tokio::test]
    async fn close_all_drains_open_positions() {
        let orch = orchestrator();
        orch.position_manager.open_position("BTCUSDT", Side::Long, 100.0, 1.0, 50.0, 150.0);
        orch.position_manager.update_price("BTCUSDT", 105.0);
        orch.close_all(ExitReason::EndOfData).await;
        assert!(orch.position_manager.get_open_positions().is_empty());
    }
}
