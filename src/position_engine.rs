// =============================================================================
// Position Engine — open/closed state machine with stop-loss, take-profit,
// and max-holding-time exits
// =============================================================================
//
// Life-cycle: Open -> Closed (stop-loss / take-profit / signal / timeout /
// end-of-data). A position closes in one shot, no partial exits. At most
// one open position per symbol is enforced by the caller
// via `has_open_position` before calling `open_position`.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::model::{ExitReason, Position, Side, TradeRecord};

pub struct PositionManager {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<TradeRecord>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self { open: RwLock::new(Vec::new()), closed: RwLock::new(Vec::new()) }
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.open.read().iter().any(|p| p.symbol == symbol)
    }

    /// Open a new position and return its id. Caller is responsible for
    /// checking `has_open_position` first — enforcing at most one position
    /// per symbol is a policy decision, not an invariant of this type.
    pub fn open_position(&self, symbol: &str, side: Side, entry_price: f64, size: f64, stop_loss: f64, take_profit: f64) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let pos = Position {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            size,
            entry_ts: now,
            stop_loss,
            take_profit,
            current_price: entry_price,
        };

        info!(id = %id, symbol, %side, entry_price, size, stop_loss, take_profit, "position opened");
        self.open.write().push(pos);
        id
    }

    /// Update the `current_price` for every open position matching `symbol`.
    pub fn update_price(&self, symbol: &str, current_price: f64) {
        let mut positions = self.open.write();
        for pos in positions.iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = current_price;
        }
    }

    /// Scan all open positions and return `(position_id, reason)` pairs for
    /// positions that should exit. Pure read — does not mutate state.
    pub fn check_exits(&self, max_holding: ChronoDuration, now: DateTime<Utc>) -> Vec<(String, ExitReason)> {
        let positions = self.open.read();
        let mut exits = Vec::new();

        for pos in positions.iter() {
            let is_long = pos.side == Side::Long;
            let price = pos.current_price;
            if price <= 0.0 {
                continue;
            }

            let sl_hit = if is_long { price <= pos.stop_loss } else { price >= pos.stop_loss };
            if sl_hit {
                exits.push((pos.id.clone(), ExitReason::StopLoss));
                continue;
            }

            let tp_hit = if is_long { price >= pos.take_profit } else { price <= pos.take_profit };
            if tp_hit {
                exits.push((pos.id.clone(), ExitReason::TakeProfit));
                continue;
            }

            if now.signed_duration_since(pos.entry_ts) >= max_holding {
                exits.push((pos.id.clone(), ExitReason::Timeout));
            }
        }

        exits
    }

    /// Close a position by `id`, applying `commission` against realised PnL.
    /// Returns the completed `TradeRecord`, or `None` if no matching open
    /// position exists.
    pub fn close_position(&self, id: &str, reason: ExitReason, exit_price: f64, commission: f64) -> Option<TradeRecord> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.id == id)?;
        let pos = open.remove(idx);

        let direction = if pos.side == Side::Long { 1.0 } else { -1.0 };
        let gross_pnl = direction * (exit_price - pos.entry_price) * pos.size;
        let pnl = gross_pnl - commission;
        let pnl_percent = if pos.entry_price > 0.0 { direction * ((exit_price - pos.entry_price) / pos.entry_price) * 100.0 } else { 0.0 };

        let record = TradeRecord {
            symbol: pos.symbol.clone(),
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            size: pos.size,
            entry_ts: pos.entry_ts,
            exit_ts: Utc::now(),
            pnl,
            pnl_percent,
            commission,
            exit_reason: reason,
        };

        info!(id, %reason, exit_price, pnl, "position closed");
        self.closed.write().push(record.clone());
        Some(record)
    }

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn get_closed_trades(&self, count: usize) -> Vec<TradeRecord> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    /// Force-close every open position at `exit_price` for graceful
    /// shutdown — used when the stream ends or the process is stopped.
    pub fn close_all(&self, reason: ExitReason, exit_price_for: impl Fn(&str) -> Option<f64>, commission: f64) -> Vec<TradeRecord> {
        let ids: Vec<String> = self.open.read().iter().map(|p| p.id.clone()).collect();
        let mut records = Vec::new();
        for id in ids {
            let symbol = self.open.read().iter().find(|p| p.id == id).map(|p| p.symbol.clone());
            let price = symbol.and_then(|s| exit_price_for(&s)).unwrap_or_else(|| self.open.read().iter().find(|p| p.id == id).map(|p| p.current_price).unwrap_or(0.0));
            if let Some(record) = self.close_position(&id, reason, price, commission) {
                records.push(record);
            }
        }
        records
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open_count = self.open.read().len();
        let closed_count = self.closed.read().len();
        f.debug_struct("PositionManager").field("open_positions", &open_count).field("closed_positions", &closed_count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_loss_triggers_exit_for_long() {
        let pm = PositionManager::new();
        let id = pm.open_position("BTCUSDT", Side::Long, 100.0, 1.0, 95.0, 110.0);
        pm.update_price("BTCUSDT", 94.0);
        let exits = pm.check_exits(ChronoDuration::hours(1), Utc::now());
        assert_eq!(exits, vec![(id, ExitReason::StopLoss)]);
    }

    #[test]
    fn take_profit_triggers_exit_for_short() {
        let pm = PositionManager::new();
        let id = pm.open_position("ETHUSDT", Side::Short, 100.0, 1.0, 110.0, 90.0);
        pm.update_price("ETHUSDT", 89.0);
        let exits = pm.check_exits(ChronoDuration::hours(1), Utc::now());
        assert_eq!(exits, vec![(id, ExitReason::TakeProfit)]);
    }

    #[test]
    fn max_holding_time_triggers_timeout() {
        let pm = PositionManager::new();
        let id = pm.open_position("BTCUSDT", Side::Long, 100.0, 1.0, 90.0, 120.0);
        pm.update_price("BTCUSDT", 101.0);
        let exits = pm.check_exits(ChronoDuration::seconds(-1), Utc::now());
        assert_eq!(exits, vec![(id, ExitReason::Timeout)]);
    }

    #[test]
    fn close_position_computes_pnl_with_commission() {
        let pm = PositionManager::new();
        let id = pm.open_position("BTCUSDT", Side::Long, 100.0, 2.0, 90.0, 120.0);
        let record = pm.close_position(&id, ExitReason::TakeProfit, 120.0, 1.0).unwrap();
        assert_eq!(record.pnl, 2.0 * (120.0 - 100.0) - 1.0);
        assert!(pm.get_open_positions().is_empty());
    }

    #[test]
    fn has_open_position_reflects_state() {
        let pm = PositionManager::new();
        assert!(!pm.has_open_position("BTCUSDT"));
        let id = pm.open_position("BTCUSDT", Side::Long, 100.0, 1.0, 90.0, 110.0);
        assert!(pm.has_open_position("BTCUSDT"));
        pm.close_position(&id, ExitReason::Signal, 105.0, 0.0);
        assert!(!pm.has_open_position("BTCUSDT"));
    }
}
