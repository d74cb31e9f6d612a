// =============================================================================
// Risk Engine — daily loss cap, drawdown protection, four-factor breaker
// =============================================================================
//
// Gates, in order:
//   1. Kill switch        — manual, blocks everything until cleared.
//   2. Circuit breaker     — closed/open/half-open state machine driven by
//                            volatility, book imbalance, volume spikes, and
//                            error rate (see `CircuitBreaker` below).
//   3. Daily Loss          — trips when cumulative daily PnL loss exceeds a
//                            percentage of starting capital.
//   4. Max Drawdown        — trips when peak-to-trough equity drawdown
//                            exceeds the threshold.
//
// The engine automatically resets daily statistics when the date rolls over.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::model::AccountState;

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Thresholds for the four monitored factors plus the state machine's own
/// failure count / recovery timing.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub volatility_threshold: f64,
    pub imbalance_threshold: f64,
    pub volume_spike_multiple: f64,
    pub error_rate_threshold: f64,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            volatility_threshold: 2.0,
            imbalance_threshold: 0.8,
            volume_spike_multiple: 3.0,
            error_rate_threshold: 5.0,
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Four-factor circuit breaker: volatility, book imbalance, volume spike,
/// error rate. `evaluate` folds all four checks into a single
/// success/failure record so state transitions never observe a partially
/// updated factor set.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Evaluate the four monitored factors for one symbol tick and record
    /// success/failure as a unit. Returns the tripped factor's name, if any.
    pub fn evaluate(&self, volatility_pct: f64, depth_ratio: f64, volume_ratio_to_avg: f64, error_rate_per_sec: f64) -> Option<&'static str> {
        if volatility_pct > self.config.volatility_threshold {
            self.record_failure("volatility");
            return Some("volatility");
        }
        if depth_ratio.abs() > self.config.imbalance_threshold {
            self.record_failure("book_imbalance");
            return Some("book_imbalance");
        }
        if volume_ratio_to_avg > self.config.volume_spike_multiple {
            self.record_failure("volume_spike");
            return Some("volume_spike");
        }
        if error_rate_per_sec > self.config.error_rate_threshold {
            self.record_failure("error_rate");
            return Some("error_rate");
        }
        self.record_success();
        None
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                info!("circuit breaker: half_open -> closed on success");
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, reason: &str) {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(reason, "circuit breaker: half_open -> open on failure");
                metrics::counter!(crate::metrics::names::CIRCUIT_BREAKER_TRIPS_TOTAL).increment(1);
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(reason, consecutive_failures = inner.consecutive_failures, "circuit breaker: closed -> open");
                    metrics::counter!(crate::metrics::names::CIRCUIT_BREAKER_TRIPS_TOTAL).increment(1);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// `false` unconditionally while open; transitions to half-open once the
    /// recovery timeout has elapsed and permits exactly one probe.
    pub fn can_trade(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if let Some(opened_at) = inner.opened_at {
                    if opened_at.elapsed() >= self.config.recovery_timeout {
                        inner.state = BreakerState::HalfOpen;
                        info!("circuit breaker: open -> half_open (recovery timeout elapsed)");
                        return true;
                    }
                }
                false
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of a single gate for dashboard display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

/// Full snapshot of the risk engine's internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub risk_mode: String,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_pnl_pct: f64,
    #[serde(default)]
    pub remaining_daily_loss_pct: f64,
    #[serde(default)]
    pub max_drawdown_today: f64,
    #[serde(default)]
    pub peak_balance: f64,
    #[serde(default)]
    pub breaker_state: String,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
    #[serde(default)]
    pub current_date: String,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    risk_mode: String,
    account: AccountState,
    max_drawdown_today: f64,
    current_date: String,
    killed: bool,
}

// ---------------------------------------------------------------------------
// Risk Engine
// ---------------------------------------------------------------------------

pub struct RiskEngine {
    state: RwLock<Inner>,
    capital: f64,
    max_daily_loss_pct: f64,
    max_drawdown_pct: f64,
    pub breaker: CircuitBreaker,
}

impl RiskEngine {
    pub fn new(capital: f64, max_daily_loss_pct: f64, max_drawdown_pct: f64, breaker_config: CircuitBreakerConfig) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(capital, max_daily_loss_pct, max_drawdown_pct, "RiskEngine initialised");

        Self {
            state: RwLock::new(Inner {
                risk_mode: "Normal".to_string(),
                account: AccountState::new(capital, Utc::now()),
                max_drawdown_today: 0.0,
                current_date: today,
                killed: false,
            }),
            capital,
            max_daily_loss_pct,
            max_drawdown_pct,
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Record the realised PnL of a completed trade — `pnl` already nets out
    /// entry and exit commission — and update the running balance, the
    /// lifetime peak, and the daily-drawdown counters.
    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.account.current_balance += pnl;
        s.account.daily_pnl += pnl;

        if s.account.current_balance > s.account.peak_balance {
            s.account.peak_balance = s.account.current_balance;
        }
        let drawdown = if s.account.peak_balance > 0.0 {
            (s.account.peak_balance - s.account.current_balance) / s.account.peak_balance
        } else {
            0.0
        };
        if drawdown > s.max_drawdown_today {
            s.max_drawdown_today = drawdown;
        }

        s.risk_mode = self.compute_risk_mode(&s);

        debug!(
            pnl,
            balance = s.account.current_balance,
            daily_pnl = s.account.daily_pnl,
            drawdown = s.max_drawdown_today,
            risk_mode = %s.risk_mode,
            "trade result recorded"
        );
    }

    /// Current tradable balance, used as the execution engine's risk-sizing
    /// base.
    pub fn current_balance(&self) -> f64 {
        self.maybe_reset_daily();
        self.state.read().account.current_balance
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Check whether trading is currently allowed for a symbol. Returns
    /// `(true, None)` if every gate is clear, else `(false, Some(reason))`.
    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.maybe_reset_daily();

        if !self.breaker.can_trade() {
            let msg = format!("circuit breaker {}", self.breaker.state());
            return (false, Some(msg));
        }

        let s = self.state.read();

        if s.killed {
            return (false, Some("Kill switch activated".to_string()));
        }

        let daily_loss_pct = if self.capital > 0.0 { (-s.account.daily_pnl) / self.capital } else { 0.0 };
        if daily_loss_pct >= self.max_daily_loss_pct {
            let msg = format!(
                "Daily Loss breaker tripped: {:.2}% lost (limit {:.2}%)",
                daily_loss_pct * 100.0,
                self.max_daily_loss_pct * 100.0
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if s.max_drawdown_today >= self.max_drawdown_pct {
            let msg = format!(
                "Max Drawdown breaker tripped: {:.2}% drawdown (limit {:.2}%)",
                s.max_drawdown_today * 100.0,
                self.max_drawdown_pct * 100.0
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        (true, None)
    }

    // -------------------------------------------------------------------------
    // State snapshot
    // -------------------------------------------------------------------------

    pub fn get_state(&self) -> RiskState {
        self.maybe_reset_daily();
        let s = self.state.read();

        let daily_pnl_pct = if self.capital > 0.0 { (s.account.daily_pnl / self.capital) * 100.0 } else { 0.0 };
        let remaining_daily_loss_pct = (self.max_daily_loss_pct * 100.0) - ((-s.account.daily_pnl / self.capital.max(1.0)) * 100.0);

        let breakers = self.build_circuit_breaker_info(&s);

        RiskState {
            risk_mode: s.risk_mode.clone(),
            daily_pnl: s.account.daily_pnl,
            daily_pnl_pct,
            remaining_daily_loss_pct: remaining_daily_loss_pct.max(0.0),
            max_drawdown_today: s.max_drawdown_today,
            peak_balance: s.account.peak_balance,
            breaker_state: self.breaker.state().to_string(),
            circuit_breakers: breakers,
            current_date: s.current_date.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today);
        info!(date = %today, "daily risk counters reset (manual)");
    }

    /// Activate the kill switch — blocks all trading until manually cleared.
    pub fn kill(&self) {
        let mut s = self.state.write();
        s.killed = true;
        s.risk_mode = "KILLED".to_string();
        warn!("kill switch activated — all trading halted");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled — resetting daily risk counters");
            Self::do_reset(&mut s, &today);
        }
    }

    /// Reset the counters that are scoped to a single trading day.
    /// `peak_balance` is a lifetime high-water mark and is never touched
    /// here — only `current_balance` moving down from it drives drawdown.
    fn do_reset(s: &mut Inner, date: &str) {
        s.account.daily_pnl = 0.0;
        s.max_drawdown_today = 0.0;
        s.current_date = date.to_string();
        s.risk_mode = if s.killed { "KILLED".to_string() } else { "Normal".to_string() };
    }

    fn compute_risk_mode(&self, s: &Inner) -> String {
        if s.killed {
            return "KILLED".to_string();
        }

        let daily_loss_pct = if self.capital > 0.0 { (-s.account.daily_pnl) / self.capital } else { 0.0 };

        if self.breaker.state() == BreakerState::Open || daily_loss_pct >= self.max_daily_loss_pct || s.max_drawdown_today >= self.max_drawdown_pct {
            "BREAKER_TRIPPED".to_string()
        } else if daily_loss_pct >= self.max_daily_loss_pct * 0.75 || self.breaker.state() == BreakerState::HalfOpen {
            "Cautious".to_string()
        } else {
            "Normal".to_string()
        }
    }

    fn build_circuit_breaker_info(&self, s: &Inner) -> Vec<CircuitBreakerInfo> {
        let daily_loss_pct = if self.capital > 0.0 { ((-s.account.daily_pnl) / self.capital) * 100.0 } else { 0.0 };

        vec![
            CircuitBreakerInfo {
                name: "Daily Loss".to_string(),
                current: daily_loss_pct.max(0.0),
                limit: self.max_daily_loss_pct * 100.0,
                tripped: daily_loss_pct >= self.max_daily_loss_pct * 100.0,
            },
            CircuitBreakerInfo {
                name: "Max Drawdown".to_string(),
                current: s.max_drawdown_today * 100.0,
                limit: self.max_drawdown_pct * 100.0,
                tripped: s.max_drawdown_today >= self.max_drawdown_pct,
            },
            CircuitBreakerInfo {
                name: "Market Conditions".to_string(),
                current: match self.breaker.state() {
                    BreakerState::Closed => 0.0,
                    BreakerState::HalfOpen => 0.5,
                    BreakerState::Open => 1.0,
                },
                limit: 1.0,
                tripped: self.breaker.state() == BreakerState::Open,
            },
        ]
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("capital", &self.capital)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_drawdown_pct", &self.max_drawdown_pct)
            .field("breaker_state", &self.breaker.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_failure_threshold() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 3, ..Default::default() });
        assert!(cb.can_trade());
        cb.record_failure("x");
        cb.record_failure("x");
        assert!(cb.can_trade());
        cb.record_failure("x");
        assert!(!cb.can_trade());
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn breaker_half_open_closes_on_one_success() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        cb.record_failure("x");
        assert_eq!(cb.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_trade());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        cb.record_failure("x");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_trade());
        cb.record_failure("x");
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn evaluate_trips_on_volatility() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 1, ..Default::default() });
        let reason = cb.evaluate(3.0, 0.0, 1.0, 0.0);
        assert_eq!(reason, Some("volatility"));
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn daily_loss_gate_blocks_at_limit() {
        let engine = RiskEngine::new(10_000.0, 0.05, 0.5, CircuitBreakerConfig::default());
        engine.record_trade_result(-400.0);
        let (allowed, _) = engine.can_trade();
        assert!(allowed); // 4% loss, limit is 5%

        engine.record_trade_result(-100.0);
        let (allowed, reason) = engine.can_trade();
        assert!(!allowed);
        assert!(reason.unwrap().contains("Daily Loss"));
    }

    #[test]
    fn drawdown_gate_blocks_at_threshold() {
        let engine = RiskEngine::new(10_000.0, 0.5, 0.1, CircuitBreakerConfig::default());
        engine.record_trade_result(2_000.0); // peak becomes 12000
        engine.record_trade_result(-1_300.0); // drawdown = 1300/12000 ~ 10.8%
        let (allowed, reason) = engine.can_trade();
        assert!(!allowed);
        assert!(reason.unwrap().contains("Drawdown"));
    }

    #[test]
    fn kill_switch_blocks_trading() {
        let engine = RiskEngine::new(10_000.0, 0.05, 0.5, CircuitBreakerConfig::default());
        engine.kill();
        let (allowed, _) = engine.can_trade();
        assert!(!allowed);
    }

    #[test]
    fn open_breaker_blocks_trading_regardless_of_pnl() {
        let engine = RiskEngine::new(10_000.0, 0.5, 0.5, CircuitBreakerConfig { failure_threshold: 1, ..Default::default() });
        engine.breaker.record_failure("volatility");
        let (allowed, reason) = engine.can_trade();
        assert!(!allowed);
        assert!(reason.unwrap().contains("circuit breaker"));
    }
}
