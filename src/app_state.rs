// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth shared across the streaming, execution, and API
// tasks. Subsystems keep their own interior mutability (`RiskEngine`,
// `PositionManager`, `OrderTracker` each wrap their state behind a lock
// internally); `AppState` just ties them together and builds a unified
// snapshot for the REST/WebSocket API.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::Config;
use crate::model::{Position, TradeRecord};
use crate::order_tracker::OrderTracker;
use crate::position_engine::PositionManager;
use crate::risk::{CircuitBreakerInfo, RiskEngine};
use crate::types::BalanceInfo;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

const MAX_RECENT_ERRORS: usize = 50;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub config: RwLock<Config>,

    pub risk_engine: Arc<RiskEngine>,
    pub position_manager: Arc<PositionManager>,
    pub order_tracker: Arc<OrderTracker>,

    pub balances: RwLock<Vec<BalanceInfo>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Timestamp (ms since epoch) of the last market-data event observed by
    /// the stream transport. Zero means no event has arrived yet.
    pub stream_last_event_ms: Arc<AtomicI64>,
    /// Count of events dropped because a downstream channel was full.
    pub stream_dropped: Arc<AtomicU64>,

    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<std::time::Instant>,

    pub last_reconcile_ok: RwLock<Option<std::time::Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        risk_engine: Arc<RiskEngine>,
        position_manager: Arc<PositionManager>,
        order_tracker: Arc<OrderTracker>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            config: RwLock::new(config),
            risk_engine,
            position_manager,
            order_tracker,
            balances: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            stream_last_event_ms: Arc::new(AtomicI64::new(0)),
            stream_dropped: Arc::new(AtomicU64::new(0)),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(std::time::Instant::now()),
            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord { message: msg, code, at: Utc::now().to_rfc3339() };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    fn stream_staleness_ms(&self) -> Option<i64> {
        let last = self.stream_last_event_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some((Utc::now().timestamp_millis() - last).max(0))
    }

    /// Build a complete, serialisable snapshot of the engine state for the
    /// REST `GET /api/v1/state` endpoint and the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let config = self.config.read();
        let version = self.current_state_version();
        let risk_state = self.risk_engine.get_state();

        let ws_user_event_age_ms = self.last_ws_user_event.read().elapsed().as_millis() as u64;
        let reconcile_last_ok_age_s = self.last_reconcile_ok.read().map(|t| t.elapsed().as_secs());
        let stream_staleness_ms = self.stream_staleness_ms();

        let truth = TruthHeader {
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            dry_run: config.dry_run,
            risk_mode: risk_state.risk_mode.clone(),
            breaker_state: risk_state.breaker_state.clone(),
            ws_user_connected: *self.ws_user_connected.read(),
            last_ws_user_event_age_ms: ws_user_event_age_ms,
            reconcile_last_ok_age_s,
            reconcile_last_error: self.last_reconcile_error.read().clone(),
            stream_staleness_ms,
            stream_dropped: self.stream_dropped.load(Ordering::Relaxed),
            state_version: version,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            server_time: now.timestamp_millis(),
        };

        let positions = self.position_manager.get_open_positions();
        let closed = self.position_manager.get_closed_trades(500);
        let journal_stats = build_journal_stats(&closed);

        let risk = RiskSnapshot {
            risk_mode: risk_state.risk_mode.clone(),
            daily_pnl: risk_state.daily_pnl,
            daily_pnl_pct: risk_state.daily_pnl_pct,
            remaining_daily_loss_pct: risk_state.remaining_daily_loss_pct,
            max_drawdown_today: risk_state.max_drawdown_today,
            circuit_breakers: risk_state.circuit_breakers.clone(),
        };

        let config_summary = ConfigSummary {
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            symbols: config.symbols.clone(),
            max_position_size: config.max_position_size,
            max_daily_loss_pct: config.max_daily_loss_pct,
            dry_run: config.dry_run,
        };

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            truth,
            positions,
            recent_trades: closed.into_iter().take(100).collect(),
            risk,
            config: config_summary,
            balances: self.balances.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            pending_orders: self.order_tracker.pending_count(),
            journal_stats,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

fn build_journal_stats(closed: &[TradeRecord]) -> Option<JournalStats> {
    if closed.is_empty() {
        return None;
    }
    let total_trades = closed.len();
    let wins = closed.iter().filter(|t| t.pnl > 0.0).count();
    let win_rate = wins as f64 / total_trades as f64;
    let total_net_pnl: f64 = closed.iter().map(|t| t.pnl).sum();
    let gross_profit: f64 = closed.iter().map(|t| t.pnl).filter(|&p| p > 0.0).sum();
    let gross_loss: f64 = closed.iter().map(|t| t.pnl).filter(|&p| p < 0.0).map(f64::abs).sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    Some(JournalStats { total_trades, win_rate, total_net_pnl, profit_factor })
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("risk_engine", &self.risk_engine)
            .field("position_manager", &self.position_manager)
            .finish()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub truth: TruthHeader,
    pub positions: Vec<Position>,
    pub recent_trades: Vec<TradeRecord>,
    pub risk: RiskSnapshot,
    pub config: ConfigSummary,
    pub balances: Vec<BalanceInfo>,
    pub recent_errors: Vec<ErrorRecord>,
    pub pending_orders: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_stats: Option<JournalStats>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TruthHeader {
    pub trading_mode: String,
    pub account_mode: String,
    pub dry_run: bool,
    pub risk_mode: String,
    pub breaker_state: String,
    pub ws_user_connected: bool,
    pub last_ws_user_event_age_ms: u64,
    pub reconcile_last_ok_age_s: Option<u64>,
    pub reconcile_last_error: Option<String>,
    pub stream_staleness_ms: Option<i64>,
    pub stream_dropped: u64,
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub risk_mode: String,
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub remaining_daily_loss_pct: f64,
    pub max_drawdown_today: f64,
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub trading_mode: String,
    pub account_mode: String,
    pub symbols: Vec<String>,
    pub max_position_size: f64,
    pub max_daily_loss_pct: f64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_net_pnl: f64,
    pub profit_factor: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::order_tracker::OrderTrackerConfig;
    use crate::risk::CircuitBreakerConfig;

    fn state() -> AppState {
        AppState::new(
            Config::default(),
            Arc::new(RiskEngine::new(10_000.0, 0.05, 0.5, CircuitBreakerConfig::default())),
            Arc::new(PositionManager::new()),
            Arc::new(OrderTracker::new(OrderTrackerConfig::default())),
        )
    }

    #[test]
    fn snapshot_reflects_no_trades_initially() {
        let s = state();
        let snap = s.build_snapshot();
        assert!(snap.positions.is_empty());
        assert!(snap.journal_stats.is_none());
    }

    #[test]
    fn push_error_bumps_version_and_caps_length() {
        let s = state();
        let before = s.current_state_version();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            s.push_error(format!("err {i}"));
        }
        assert!(s.current_state_version() > before);
        assert_eq!(s.recent_errors.read().len(), MAX_RECENT_ERRORS);
    }

    #[test]
    fn stream_staleness_none_before_first_event() {
        let s = state();
        assert!(s.build_snapshot().truth.stream_staleness_ms.is_none());
    }
}
