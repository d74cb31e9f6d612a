// =============================================================================
// Persistence — append-only trade journal plus bounded in-memory read-back
// =============================================================================
//
// A write failure here must never interrupt trading, so every fallible
// operation is logged and swallowed rather than propagated — this is an
// audit trail, not a source of truth the engine depends on to run. Trades
// are also appended to a JSONL file; depths and derived features only live
// in the bounded in-memory rings below, there being no embedded store wired
// up here.
// =============================================================================

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::features::depth_imbalance;
use crate::model::{Depth, FeatureRecord, FeatureVector, TradeRecord};

/// Cap on each in-memory ring so a long session never grows them unbounded.
const HISTORY_CAPACITY: usize = 10_000;

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn store_trade(&self, record: &TradeRecord);
    async fn store_depth(&self, depth: &Depth);
    async fn get_trades(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TradeRecord>;
    async fn get_depths(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Depth>;
    async fn get_recent_features(&self, symbol: &str, n: usize) -> Vec<FeatureRecord>;
    async fn close(&self);
}

struct History {
    trades: VecDeque<TradeRecord>,
    depths: VecDeque<Depth>,
    features: VecDeque<FeatureRecord>,
}

impl History {
    fn new() -> Self {
        Self { trades: VecDeque::new(), depths: VecDeque::new(), features: VecDeque::new() }
    }

    fn push_bounded<T>(queue: &mut VecDeque<T>, item: T) {
        queue.push_back(item);
        if queue.len() > HISTORY_CAPACITY {
            queue.pop_front();
        }
    }
}

pub struct JsonlPersistence {
    path: PathBuf,
    write_lock: Mutex<()>,
    history: Mutex<History>,
}

impl JsonlPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()), history: Mutex::new(History::new()) }
    }

    fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")
    }
}

#[async_trait]
impl Persistence for JsonlPersistence {
    async fn store_trade(&self, record: &TradeRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialise trade record");
                return;
            }
        };
        {
            let _guard = self.write_lock.lock();
            if let Err(e) = Self::append_line(&self.path, &line) {
                warn!(error = %e, path = %self.path.display(), "failed to append trade record");
            }
        }
        History::push_bounded(&mut self.history.lock().trades, record.clone());
    }

    async fn store_depth(&self, depth: &Depth) {
        let mut history = self.history.lock();
        let feature = FeatureRecord {
            symbol: depth.symbol.clone(),
            features: FeatureVector { tick_ratio: 0.0, depth_ratio: depth_imbalance(depth.bid_vol, depth.ask_vol), price_dist: 0.0 },
            ts: depth.ts,
        };
        History::push_bounded(&mut history.features, feature);
        History::push_bounded(&mut history.depths, depth.clone());
    }

    async fn get_trades(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TradeRecord> {
        self.history.lock().trades.iter().filter(|t| t.symbol == symbol && t.exit_ts >= start && t.exit_ts <= end).cloned().collect()
    }

    async fn get_depths(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Depth> {
        self.history.lock().depths.iter().filter(|d| d.symbol == symbol && d.ts >= start && d.ts <= end).cloned().collect()
    }

    async fn get_recent_features(&self, symbol: &str, n: usize) -> Vec<FeatureRecord> {
        self.history.lock().features.iter().rev().filter(|f| f.symbol == symbol).take(n).cloned().collect::<Vec<_>>().into_iter().rev().collect()
    }

    async fn close(&self) {
        info!(path = %self.path.display(), "trade journal closed");
    }
}

/// No-op sink used in tests and dry-run-only configurations where a journal
/// file is not wanted.
pub struct NullPersistence;

#[async_trait]
impl Persistence for NullPersistence {
    async fn store_trade(&self, _record: &TradeRecord) {}
    async fn store_depth(&self, _depth: &Depth) {}
    async fn get_trades(&self, _symbol: &str, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Vec<TradeRecord> {
        Vec::new()
    }
    async fn get_depths(&self, _symbol: &str, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Vec<Depth> {
        Vec::new()
    }
    async fn get_recent_features(&self, _symbol: &str, _n: usize) -> Vec<FeatureRecord> {
        Vec::new()
    }
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile_shim::temp_path;

    use crate::model::{ExitReason, Side};

    mod tempfile_shim {
        use std::path::PathBuf;
        pub fn temp_path(name: &str) -> PathBuf {
            let mut p = std::env::temp_dir();
            p.push(format!("{name}-{}", std::process::id()));
            p
        }
    }

    fn sample_record() -> TradeRecord {
        TradeRecord {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 101.0,
            size: 1.0,
            entry_ts: Utc::now(),
            exit_ts: Utc::now(),
            pnl: 1.0,
            pnl_percent: 1.0,
            commission: 0.0,
            exit_reason: ExitReason::TakeProfit,
        }
    }

    fn sample_depth() -> Depth {
        Depth::new("BTCUSDT".to_string(), 2.0, 1.0, 100.0, 100.5, Utc::now(), 1).unwrap()
    }

    #[tokio::test]
    async fn writes_one_line_per_record() {
        let path = temp_path("journal-test");
        let _ = std::fs::remove_file(&path);
        let p = JsonlPersistence::new(&path);
        p.store_trade(&sample_record()).await;
        p.store_trade(&sample_record()).await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn get_trades_filters_by_symbol_and_window() {
        let path = temp_path("journal-test-filter");
        let _ = std::fs::remove_file(&path);
        let p = JsonlPersistence::new(&path);
        p.store_trade(&sample_record()).await;
        let now = Utc::now();
        let found = p.get_trades("BTCUSDT", now - Duration::minutes(1), now + Duration::minutes(1)).await;
        assert_eq!(found.len(), 1);
        let none = p.get_trades("ETHUSDT", now - Duration::minutes(1), now + Duration::minutes(1)).await;
        assert!(none.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn store_depth_feeds_depths_and_features() {
        let path = temp_path("journal-test-depth");
        let _ = std::fs::remove_file(&path);
        let p = JsonlPersistence::new(&path);
        p.store_depth(&sample_depth()).await;
        let now = Utc::now();
        let depths = p.get_depths("BTCUSDT", now - Duration::minutes(1), now + Duration::minutes(1)).await;
        assert_eq!(depths.len(), 1);
        let features = p.get_recent_features("BTCUSDT", 10).await;
        assert_eq!(features.len(), 1);
        assert!((features[0].features.depth_ratio - (1.0 / 3.0)).abs() < 1e-9);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn null_persistence_is_a_noop() {
        let p = NullPersistence;
        p.store_trade(&sample_record()).await;
        p.store_depth(&sample_depth()).await;
        assert!(p.get_trades("BTCUSDT", Utc::now(), Utc::now()).await.is_empty());
        assert!(p.get_depths("BTCUSDT", Utc::now(), Utc::now()).await.is_empty());
        assert!(p.get_recent_features("BTCUSDT", 10).await.is_empty());
        p.close().await;
    }
}
