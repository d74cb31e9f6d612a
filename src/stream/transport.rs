// =============================================================================
// Stream Transport — one multiplexed WebSocket connection, many symbols
// =============================================================================
//
// One connection subscribed to every symbol's trade and
// depth channels at once, publishing decoded events onto bounded
// drop-newest channels so a slow consumer can never make the socket reader
// block. Decoding happens on a small worker pool sharing one raw-message
// channel, each worker reusing a buffer from a small freelist — the same
// reuse-don't-reallocate idiom as the candle ring buffer.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::model::{Depth, Trade};

const EVENT_CHANNEL_CAPACITY: usize = 1000;
const RAW_CHANNEL_CAPACITY: usize = 1000;
const DECODE_WORKERS: usize = 5;
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Trade(Trade),
    Depth(Depth),
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    pub symbols: Vec<String>,
    pub ping_interval: Duration,
}

/// Small reusable-string freelist, bounded so it never grows unbounded
/// across a long session.
struct BufferPool {
    free: SyncMutex<Vec<String>>,
}

impl BufferPool {
    fn new() -> Self {
        Self { free: SyncMutex::new(Vec::new()) }
    }

    fn acquire(&self) -> String {
        self.free.lock().pop().unwrap_or_default()
    }

    fn release(&self, mut buf: String) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < DECODE_WORKERS * 4 {
            free.push(buf);
        }
    }
}

/// Tracks the last sequence number seen per `(symbol, channel)` and logs a
/// warning on a detected gap. No resync is requested — see the module's
/// design notes.
#[derive(Default)]
struct SequenceTracker {
    last_seq: SyncMutex<HashMap<String, u64>>,
}

impl SequenceTracker {
    fn observe(&self, key: &str, seq: u64) {
        let mut map = self.last_seq.lock();
        if let Some(&last) = map.get(key) {
            if seq > last + 1 {
                warn!(key, expected = last + 1, got = seq, gap = seq - last - 1, "sequence gap detected");
                metrics::counter!(crate::metrics::names::STREAM_SEQUENCE_GAPS_TOTAL).increment(1);
            }
        }
        map.insert(key.to_string(), seq);
    }
}

pub struct StreamHandle {
    pub events: mpsc::Receiver<StreamEvent>,
    last_event_ms: Arc<AtomicI64>,
    dropped: Arc<AtomicU64>,
}

impl StreamHandle {
    pub fn is_alive(&self, max_staleness: Duration) -> bool {
        let last = self.last_event_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let now = Utc::now().timestamp_millis();
        (now - last) <= max_staleness.as_millis() as i64
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Milliseconds since epoch of the last decoded event, or 0 if none yet.
    pub fn last_event_ms(&self) -> i64 {
        self.last_event_ms.load(Ordering::Relaxed)
    }

    /// Clone the liveness counters out, for callers that need to move
    /// `events` out of the handle (a partial move) but still want to poll
    /// liveness from another task.
    pub fn liveness_handles(&self) -> (Arc<AtomicI64>, Arc<AtomicU64>) {
        (self.last_event_ms.clone(), self.dropped.clone())
    }
}

pub struct StreamTransport;

impl StreamTransport {
    /// Spawn the transport as a background task and return a handle the
    /// caller drains events from. Runs until `shutdown` is cancelled,
    /// reconnecting with exponential backoff on any disconnect.
    pub fn spawn(config: StreamConfig, shutdown: tokio_util::sync::CancellationToken) -> StreamHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let last_event_ms = Arc::new(AtomicI64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let last_event_ms_task = Arc::clone(&last_event_ms);
        let dropped_task = Arc::clone(&dropped);

        tokio::spawn(async move {
            Self::run_forever(config, events_tx, last_event_ms_task, dropped_task, shutdown).await;
        });

        StreamHandle { events: events_rx, last_event_ms, dropped }
    }

    async fn run_forever(
        config: StreamConfig,
        events_tx: mpsc::Sender<StreamEvent>,
        last_event_ms: Arc<AtomicI64>,
        dropped: Arc<AtomicU64>,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        let mut backoff = RECONNECT_MIN;

        loop {
            if shutdown.is_cancelled() {
                info!("stream transport shutting down");
                return;
            }

            match Self::run_once(&config, &events_tx, &last_event_ms, &dropped, &shutdown).await {
                Ok(()) => {
                    backoff = RECONNECT_MIN;
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "stream connection failed — reconnecting with backoff");
                    metrics::counter!(crate::metrics::names::STREAM_RECONNECTS_TOTAL).increment(1);
                }
            }

            if shutdown.is_cancelled() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.cancelled() => { return; }
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    async fn run_once(
        config: &StreamConfig,
        events_tx: &mpsc::Sender<StreamEvent>,
        last_event_ms: &Arc<AtomicI64>,
        dropped: &Arc<AtomicU64>,
        shutdown: &tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        info!(url = %config.ws_url, symbols = ?config.symbols, "connecting to market-data stream");
        let (ws_stream, _response) = connect_async(&config.ws_url).await?;
        info!("market-data stream connected");

        let (mut write, mut read) = ws_stream.split();

        let sub_msg = build_subscription(&config.symbols);
        write.send(Message::Text(sub_msg)).await?;

        let (raw_tx, raw_rx) = mpsc::channel::<String>(RAW_CHANNEL_CAPACITY);
        let raw_rx = Arc::new(AsyncMutex::new(raw_rx));
        let pool = Arc::new(BufferPool::new());
        let seq_tracker = Arc::new(SequenceTracker::default());

        let mut workers = Vec::with_capacity(DECODE_WORKERS);
        for _ in 0..DECODE_WORKERS {
            let raw_rx = Arc::clone(&raw_rx);
            let events_tx = events_tx.clone();
            let last_event_ms = Arc::clone(last_event_ms);
            let dropped = Arc::clone(dropped);
            let pool = Arc::clone(&pool);
            let seq_tracker = Arc::clone(&seq_tracker);
            workers.push(tokio::spawn(async move {
                decode_worker(raw_rx, events_tx, last_event_ms, dropped, pool, seq_tracker).await;
            }));
        }

        let mut ping_ticker = tokio::time::interval(config.ping_interval);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break Ok(());
                }
                _ = ping_ticker.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        break Err(anyhow::anyhow!("failed to send ping"));
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if raw_tx.try_send(text).is_err() {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                metrics::counter!(crate::metrics::names::EVENTS_DROPPED_TOTAL).increment(1);
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_event_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!(?frame, "stream closed by remote");
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break Err(anyhow::anyhow!("stream read error: {e}"));
                        }
                        None => {
                            break Ok(());
                        }
                    }
                }
            }
        };

        drop(raw_tx);
        for w in workers {
            let _ = w.await;
        }

        result
    }
}

fn build_subscription(symbols: &[String]) -> String {
    let channels: Vec<String> = symbols
        .iter()
        .flat_map(|s| vec![format!("{}@trade", s.to_lowercase()), format!("{}@depth", s.to_lowercase())])
        .collect();
    serde_json::json!({ "op": "subscribe", "args": channels }).to_string()
}

async fn decode_worker(
    raw_rx: Arc<AsyncMutex<mpsc::Receiver<String>>>,
    events_tx: mpsc::Sender<StreamEvent>,
    last_event_ms: Arc<AtomicI64>,
    dropped: Arc<AtomicU64>,
    pool: Arc<BufferPool>,
    seq_tracker: Arc<SequenceTracker>,
) {
    loop {
        let text = {
            let mut rx = raw_rx.lock().await;
            match rx.recv().await {
                Some(t) => t,
                None => return,
            }
        };

        match decode_message(&text) {
            Ok(Some(event)) => {
                if let StreamEvent::Trade(t) = &event {
                    seq_tracker.observe(&format!("{}:trade", t.symbol), t.seq);
                }
                if let StreamEvent::Depth(d) = &event {
                    seq_tracker.observe(&format!("{}:depth", d.symbol), d.seq);
                }
                last_event_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                if events_tx.try_send(event).is_err() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(crate::metrics::names::EVENTS_DROPPED_TOTAL).increment(1);
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "failed to decode market-data message");
            }
        }

        pool.release(text);
    }
}

#[derive(Deserialize)]
struct WireTrade {
    symbol: String,
    price: String,
    qty: String,
    seq: u64,
    #[serde(rename = "ts")]
    ts_ms: i64,
}

#[derive(Deserialize)]
struct WireDepthLevel(String, String);

#[derive(Deserialize)]
struct WireDepth {
    symbol: String,
    bids: Vec<WireDepthLevel>,
    asks: Vec<WireDepthLevel>,
    seq: u64,
    #[serde(rename = "ts")]
    ts_ms: i64,
}

fn decode_message(text: &str) -> anyhow::Result<Option<StreamEvent>> {
    let root: serde_json::Value = serde_json::from_str(text)?;
    let channel = root.get("channel").and_then(|v| v.as_str()).unwrap_or("");

    if channel.ends_with("@trade") {
        let wire: WireTrade = serde_json::from_value(root)?;
        let ts = chrono::DateTime::from_timestamp_millis(wire.ts_ms).unwrap_or_else(Utc::now);
        let price: f64 = wire.price.parse()?;
        let qty: f64 = wire.qty.parse()?;
        let trade = Trade::new(wire.symbol, price, qty, ts, wire.seq).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        return Ok(Some(StreamEvent::Trade(trade)));
    }

    if channel.ends_with("@depth") {
        let wire: WireDepth = serde_json::from_value(root)?;
        let ts = chrono::DateTime::from_timestamp_millis(wire.ts_ms).unwrap_or_else(Utc::now);
        let best_bid = wire.bids.first().ok_or_else(|| anyhow::anyhow!("empty bids"))?;
        let best_ask = wire.asks.first().ok_or_else(|| anyhow::anyhow!("empty asks"))?;
        let bid_price: f64 = best_bid.0.parse()?;
        let bid_vol: f64 = wire.bids.iter().filter_map(|l| l.1.parse::<f64>().ok()).sum();
        let ask_price: f64 = best_ask.0.parse()?;
        let ask_vol: f64 = wire.asks.iter().filter_map(|l| l.1.parse::<f64>().ok()).sum();
        let depth = Depth::new(wire.symbol, bid_vol, ask_vol, bid_price, ask_price, ts, wire.seq).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        return Ok(Some(StreamEvent::Depth(depth)));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_trade_message() {
        let text = serde_json::json!({
            "channel": "btcusdt@trade",
            "symbol": "BTCUSDT",
            "price": "100.5",
            "qty": "1.2",
            "seq": 7,
            "ts": 1_700_000_000_000i64,
        })
        .to_string();
        let event = decode_message(&text).unwrap().unwrap();
        match event {
            StreamEvent::Trade(t) => {
                assert_eq!(t.symbol, "BTCUSDT");
                assert_eq!(t.price, 100.5);
                assert_eq!(t.seq, 7);
            }
            _ => panic!("expected trade event"),
        }
    }

    #[test]
    fn decode_depth_message() {
        let text = serde_json::json!({
            "channel": "btcusdt@depth",
            "symbol": "BTCUSDT",
            "bids": [["100.0", "2.0"], ["99.5", "1.0"]],
            "asks": [["100.5", "1.5"], ["101.0", "2.0"]],
            "seq": 3,
            "ts": 1_700_000_000_000i64,
        })
        .to_string();
        let event = decode_message(&text).unwrap().unwrap();
        match event {
            StreamEvent::Depth(d) => {
                assert_eq!(d.bid_price, 100.0);
                assert_eq!(d.ask_price, 100.5);
                assert_eq!(d.bid_vol, 3.0);
            }
            _ => panic!("expected depth event"),
        }
    }

    #[test]
    fn decode_unknown_channel_returns_none() {
        let text = serde_json::json!({ "channel": "pong" }).to_string();
        assert!(decode_message(&text).unwrap().is_none());
    }

    #[test]
    fn sequence_tracker_logs_gap_without_panicking() {
        let tracker = SequenceTracker::default();
        tracker.observe("BTCUSDT:trade", 1);
        tracker.observe("BTCUSDT:trade", 5); // gap, should just warn
        tracker.observe("BTCUSDT:trade", 6);
    }

    #[test]
    fn buffer_pool_reuses_released_buffers() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf.push_str("hello");
        pool.release(buf);
        let reused = pool.acquire();
        assert_eq!(reused, "");
    }
}
