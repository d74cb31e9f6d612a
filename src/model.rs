// =============================================================================
// Core Data Model — Trade, Depth, Position, TrackedOrder, AccountState
// =============================================================================
//
// Validation lives in the constructors so that an in-memory value of these
// types is always well-formed; downstream code never re-checks invariants
// already enforced here.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Trade / Depth (wire-level market data)
// ---------------------------------------------------------------------------

/// A single executed trade print.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
    pub ts: DateTime<Utc>,
    pub seq: u64,
}

impl Trade {
    /// Construct a trade, rejecting non-positive or non-finite price/qty.
    pub fn new(symbol: impl Into<String>, price: f64, qty: f64, ts: DateTime<Utc>, seq: u64) -> Result<Self, EngineError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::FeatureInvalid(format!("trade price invalid: {price}")));
        }
        if !qty.is_finite() || qty <= 0.0 {
            return Err(EngineError::FeatureInvalid(format!("trade qty invalid: {qty}")));
        }
        Ok(Self { symbol: symbol.into(), price, qty, ts, seq })
    }
}

/// A top-of-book depth snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Depth {
    pub symbol: String,
    pub bid_vol: f64,
    pub ask_vol: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub mid_price: f64,
    pub ts: DateTime<Utc>,
    pub seq: u64,
}

impl Depth {
    /// Construct a depth snapshot, rejecting crossed books or non-positive
    /// volumes. `mid_price` is derived, not taken from the caller.
    pub fn new(
        symbol: impl Into<String>,
        bid_vol: f64,
        ask_vol: f64,
        bid_price: f64,
        ask_price: f64,
        ts: DateTime<Utc>,
        seq: u64,
    ) -> Result<Self, EngineError> {
        if !(bid_price.is_finite() && ask_price.is_finite()) || bid_price <= 0.0 || ask_price <= 0.0 {
            return Err(EngineError::FeatureInvalid("depth price invalid".into()));
        }
        if ask_price <= bid_price {
            return Err(EngineError::FeatureInvalid(format!(
                "crossed book: bid={bid_price} ask={ask_price}"
            )));
        }
        if !(bid_vol.is_finite() && ask_vol.is_finite()) || bid_vol <= 0.0 || ask_vol <= 0.0 {
            return Err(EngineError::FeatureInvalid("depth volume invalid".into()));
        }
        Ok(Self {
            symbol: symbol.into(),
            bid_vol,
            ask_vol,
            bid_price,
            ask_price,
            mid_price: (bid_price + ask_price) / 2.0,
            ts,
            seq,
        })
    }
}

// ---------------------------------------------------------------------------
// Feature vector
// ---------------------------------------------------------------------------

/// A snapshot of the three incremental features fed into the predictor gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector {
    pub tick_ratio: f64,
    pub depth_ratio: f64,
    pub price_dist: f64,
}

impl FeatureVector {
    pub fn is_finite(&self) -> bool {
        self.tick_ratio.is_finite() && self.depth_ratio.is_finite() && self.price_dist.is_finite()
    }

    /// Round to a fixed precision for use as a cache fingerprint.
    pub fn fingerprint(&self, decimals: u32) -> (i64, i64, i64) {
        let f = 10f64.powi(decimals as i32);
        (
            (self.tick_ratio * f).round() as i64,
            (self.depth_ratio * f).round() as i64,
            (self.price_dist * f).round() as i64,
        )
    }
}

/// A `FeatureVector` tagged with the symbol and time it was observed at,
/// the unit the persistence journal keeps feature history in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub symbol: String,
    pub features: FeatureVector,
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Position / closed trade record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// An open position. At most one per symbol is enforced by `PositionManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub entry_ts: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,
    #[serde(default)]
    pub current_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    Timeout,
    EndOfData,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Signal => "signal",
            Self::Timeout => "timeout",
            Self::EndOfData => "end_of_data",
        };
        write!(f, "{s}")
    }
}

/// A closed (realised) trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub entry_ts: DateTime<Utc>,
    pub exit_ts: DateTime<Utc>,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub commission: f64,
    pub exit_reason: ExitReason,
}

// ---------------------------------------------------------------------------
// Order lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
    Timeout,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// An order tracked through its full lifecycle by the order tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: String,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Account state
// ---------------------------------------------------------------------------

/// Account-level balance and PnL state, updated atomically on fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub daily_pnl: f64,
    pub daily_reset_ts: DateTime<Utc>,
}

impl AccountState {
    pub fn new(initial_balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            initial_balance,
            current_balance: initial_balance,
            peak_balance: initial_balance,
            daily_pnl: 0.0,
            daily_reset_ts: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_rejects_non_positive_price() {
        assert!(Trade::new("BTCUSDT", 0.0, 1.0, Utc::now(), 1).is_err());
        assert!(Trade::new("BTCUSDT", -1.0, 1.0, Utc::now(), 1).is_err());
        assert!(Trade::new("BTCUSDT", f64::NAN, 1.0, Utc::now(), 1).is_err());
    }

    #[test]
    fn trade_rejects_non_positive_qty() {
        assert!(Trade::new("BTCUSDT", 100.0, 0.0, Utc::now(), 1).is_err());
    }

    #[test]
    fn trade_accepts_valid_input() {
        let t = Trade::new("BTCUSDT", 100.0, 1.5, Utc::now(), 1).unwrap();
        assert_eq!(t.price, 100.0);
    }

    #[test]
    fn depth_rejects_crossed_book() {
        assert!(Depth::new("BTCUSDT", 1.0, 1.0, 101.0, 100.0, Utc::now(), 1).is_err());
        assert!(Depth::new("BTCUSDT", 1.0, 1.0, 100.0, 100.0, Utc::now(), 1).is_err());
    }

    #[test]
    fn depth_computes_mid_price() {
        let d = Depth::new("BTCUSDT", 1.0, 1.0, 100.0, 102.0, Utc::now(), 1).unwrap();
        assert_eq!(d.mid_price, 101.0);
    }

    #[test]
    fn depth_rejects_non_positive_volume() {
        assert!(Depth::new("BTCUSDT", 0.0, 1.0, 100.0, 101.0, Utc::now(), 1).is_err());
    }

    #[test]
    fn feature_vector_fingerprint_rounds() {
        let a = FeatureVector { tick_ratio: 0.12345, depth_ratio: -0.5, price_dist: 1.0 };
        let b = FeatureVector { tick_ratio: 0.12349, depth_ratio: -0.5, price_dist: 1.0 };
        assert_eq!(a.fingerprint(2), b.fingerprint(2));
    }
}
