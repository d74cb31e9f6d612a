// =============================================================================
// Exchange REST Client — double-SHA256 signed requests against the futures API
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised. Every signed
// request carries `api-key`, `nonce`, `timestamp`, and `sign` headers. The
// signature is `SHA256(SHA256(nonce || timestamp || apiKey) || secret)`,
// hex-encoded — two rounds. This venue's auth scheme nests a pre-hash of
// the request identity inside the secret-keyed hash rather than keying an
// HMAC directly.
//
// Responses are wrapped in a `{code, msg, data}` envelope. A handful of
// non-zero codes are non-fatal (position already at requested value,
// margin mode already set) and are folded into success rather than
// propagated as errors — see `EngineError::is_non_fatal_code`.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::Side;
use crate::order_tracker::OrderSubmitter;

use super::rate_limit::RateLimiter;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<T>,
}

/// Signed REST client for the futures venue.
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    nonce: AtomicU64,
    pub rate_limiter: RateLimiter,
}

impl ExchangeClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.into(),
            client,
            nonce: AtomicU64::new(Self::timestamp_ms()),
            rate_limiter: RateLimiter::new(),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before UNIX epoch").as_millis() as u64
    }

    /// A strictly increasing nonce, seeded from wall-clock time at startup.
    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// `SHA256(SHA256(nonce || timestamp || apiKey) || secret)`, hex-encoded.
    fn sign(&self, nonce: u64, timestamp: u64) -> String {
        let inner = Sha256::digest(format!("{nonce}{timestamp}{}", self.api_key).as_bytes());
        let mut outer = Sha256::new();
        outer.update(inner);
        outer.update(self.secret.as_bytes());
        hex::encode(outer.finalize())
    }

    fn auth_headers(&self) -> EngineResult<(HeaderMap, u64, u64)> {
        let nonce = self.next_nonce();
        let timestamp = Self::timestamp_ms();
        let sign = self.sign(nonce, timestamp);

        let mut headers = HeaderMap::new();
        headers.insert("api-key", HeaderValue::from_str(&self.api_key).map_err(|e| EngineError::SignatureError(e.to_string()))?);
        headers.insert("nonce", HeaderValue::from_str(&nonce.to_string()).unwrap());
        headers.insert("timestamp", HeaderValue::from_str(&timestamp.to_string()).unwrap());
        headers.insert("sign", HeaderValue::from_str(&sign).map_err(|e| EngineError::SignatureError(e.to_string()))?);
        Ok((headers, nonce, timestamp))
    }

    async fn send_signed<T: for<'de> Deserialize<'de> + Default>(&self, method: reqwest::Method, path: &str, body: Option<serde_json::Value>) -> EngineResult<T> {
        let (headers, _, _) = self.auth_headers()?;
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.client.request(method, &url).headers(headers);
        if let Some(b) = &body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| EngineError::ConnectionLost(e.to_string()))?;
        self.rate_limiter.update_from_headers(resp.headers());

        let envelope: Envelope<T> = resp.json().await.map_err(|e| EngineError::ParseError(e.to_string()))?;

        if envelope.code != 0 {
            if EngineError::is_non_fatal_code(envelope.code) {
                debug!(code = envelope.code, msg = %envelope.msg, "remote returned non-fatal code — treating as success");
            } else {
                warn!(code = envelope.code, msg = %envelope.msg, "remote rejected request");
                return Err(EngineError::RemoteRejected { code: envelope.code, msg: envelope.msg });
            }
        }

        envelope.data.ok_or_else(|| EngineError::ParseError("response envelope missing data".into()))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::place_order")]
    pub async fn place_order(&self, symbol: &str, side: &str, order_type: &str, qty: f64, trade_side: &str) -> EngineResult<String> {
        if !self.rate_limiter.can_place_order() {
            return Err(EngineError::ConnectionLost("rate limit: order throughput exceeded".into()));
        }
        let body = json!({
            "symbol": symbol,
            "side": side,
            "tradeSide": trade_side,
            "qty": qty,
            "orderType": order_type,
        });
        let data: serde_json::Value = self.send_signed(reqwest::Method::POST, "/api/v1/futures/trade/place_order", Some(body)).await?;
        self.rate_limiter.record_order_sent();
        let order_id = data.get("orderId").and_then(|v| v.as_str()).map(|s| s.to_string()).unwrap_or_else(|| data.to_string());
        debug!(symbol, side, trade_side, order_type, qty, order_id = %order_id, "order placed");
        Ok(order_id)
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()> {
        let body = json!({ "symbol": symbol, "orderId": order_id });
        let _: serde_json::Value = self.send_signed(reqwest::Method::POST, "/api/v1/futures/trade/cancel_order", Some(body)).await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::change_leverage")]
    pub async fn change_leverage(&self, symbol: &str, leverage: u32) -> EngineResult<()> {
        let body = json!({ "symbol": symbol, "leverage": leverage });
        let _: serde_json::Value = self.send_signed(reqwest::Method::POST, "/api/v1/futures/account/change_leverage", Some(body)).await?;
        Ok(())
    }

    /// `margin_coin` is required by the venue when `mode == "ISOLATION"`, and
    /// omitted otherwise.
    #[instrument(skip(self), name = "exchange::change_margin_mode")]
    pub async fn change_margin_mode(&self, symbol: &str, mode: &str, margin_coin: Option<&str>) -> EngineResult<()> {
        let mut body = json!({ "symbol": symbol, "marginMode": mode });
        if mode == "ISOLATION" {
            if let Some(coin) = margin_coin {
                body["marginCoin"] = json!(coin);
            }
        }
        let _: serde_json::Value = self.send_signed(reqwest::Method::POST, "/api/v1/futures/account/change_margin_mode", Some(body)).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::get_account")]
    pub async fn get_account(&self) -> EngineResult<serde_json::Value> {
        self.send_signed(reqwest::Method::GET, "/api/v1/futures/account", None).await
    }

    #[instrument(skip(self), name = "exchange::get_balance")]
    pub async fn get_balance(&self, asset: &str) -> EngineResult<f64> {
        let account = self.get_account().await?;
        let balances = account["balances"].as_array().ok_or_else(|| EngineError::ParseError("account response missing balances array".into()))?;
        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                return Ok(free);
            }
        }
        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }

    // -------------------------------------------------------------------------
    // Public market data (unsigned)
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> EngineResult<serde_json::Value> {
        let url = format!("{}/api/v1/market/klines?symbol={symbol}&interval={interval}&limit={limit}", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| EngineError::ConnectionLost(e.to_string()))?;
        let envelope: Envelope<serde_json::Value> = resp.json().await.map_err(|e| EngineError::ParseError(e.to_string()))?;
        envelope.data.ok_or_else(|| EngineError::ParseError("klines response missing data".into()))
    }

    #[instrument(skip(self), name = "exchange::get_depth")]
    pub async fn get_depth(&self, symbol: &str) -> EngineResult<serde_json::Value> {
        let url = format!("{}/api/v1/market/depth?symbol={symbol}", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| EngineError::ConnectionLost(e.to_string()))?;
        let envelope: Envelope<serde_json::Value> = resp.json().await.map_err(|e| EngineError::ParseError(e.to_string()))?;
        envelope.data.ok_or_else(|| EngineError::ParseError("depth response missing data".into()))
    }

    #[instrument(skip(self), name = "exchange::get_trades")]
    pub async fn get_trades(&self, symbol: &str, limit: u32) -> EngineResult<serde_json::Value> {
        let url = format!("{}/api/v1/market/trades?symbol={symbol}&limit={limit}", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| EngineError::ConnectionLost(e.to_string()))?;
        let envelope: Envelope<serde_json::Value> = resp.json().await.map_err(|e| EngineError::ParseError(e.to_string()))?;
        envelope.data.ok_or_else(|| EngineError::ParseError("trades response missing data".into()))
    }
}

#[async_trait]
impl OrderSubmitter for ExchangeClient {
    async fn submit_order(&self, symbol: &str, side: Side, qty: f64, order_type: &str, trade_side: &str) -> EngineResult<String> {
        let side_str = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        self.place_order(symbol, side_str, order_type, qty, trade_side).await
    }

    async fn cancel_order(&self, symbol: &str, client_id: &str) -> EngineResult<()> {
        ExchangeClient::cancel_order(self, symbol, client_id).await
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient").field("api_key", &"<redacted>").field("secret", &"<redacted>").field("base_url", &self.base_url).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic_for_fixed_inputs() {
        let client = ExchangeClient::new("key123", "secret456", "https://example.invalid");
        let a = client.sign(1, 1000);
        let b = client.sign(1, 1000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA256 digest
    }

    #[test]
    fn signing_differs_on_nonce() {
        let client = ExchangeClient::new("key123", "secret456", "https://example.invalid");
        let a = client.sign(1, 1000);
        let b = client.sign(2, 1000);
        assert_ne!(a, b);
    }

    #[test]
    fn non_fatal_codes_are_recognised() {
        assert!(EngineError::is_non_fatal_code(34002));
        assert!(EngineError::is_non_fatal_code(10007));
        assert!(!EngineError::is_non_fatal_code(1));
    }
}
