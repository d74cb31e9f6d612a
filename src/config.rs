// =============================================================================
// Engine Configuration — hot-loadable settings with atomic save
// =============================================================================
//
// Every tunable lives here. `#[serde(default)]` on every field means adding
// a field later never breaks loading an older config file. Saving uses an
// atomic tmp+rename pattern to avoid corruption on crash.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::{AccountMode, TradingMode};

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}
fn default_base_url() -> String {
    "https://api.exchange.invalid".to_string()
}
fn default_ws_url() -> String {
    "wss://stream.exchange.invalid/ws".to_string()
}
fn default_vwap_window_secs() -> u64 {
    60
}
fn default_vwap_size() -> usize {
    600
}
fn default_tick_size() -> usize {
    50
}
fn default_base_size_ratio() -> f64 {
    0.01
}
fn default_max_position_size() -> f64 {
    0.1
}
fn default_max_daily_loss_pct() -> f64 {
    0.05
}
fn default_max_price_distance() -> f64 {
    4.0
}
fn default_prob_threshold() -> f64 {
    0.6
}
fn default_metrics_port() -> u16 {
    9100
}
fn default_ping_interval_secs() -> u64 {
    15
}
fn default_rest_timeout_secs() -> u64 {
    10
}
fn default_max_drawdown_protection() -> f64 {
    0.2
}
fn default_initial_capital() -> f64 {
    10_000.0
}
fn default_commission() -> f64 {
    0.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: f64,
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,
    #[serde(default = "default_volume_spike_multiple")]
    pub volume_spike_multiple: f64,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_volatility_threshold() -> f64 {
    2.0
}
fn default_imbalance_threshold() -> f64 {
    0.8
}
fn default_volume_spike_multiple() -> f64 {
    3.0
}
fn default_error_rate_threshold() -> f64 {
    5.0
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_timeout_secs() -> u64 {
    300
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            volatility_threshold: default_volatility_threshold(),
            imbalance_threshold: default_imbalance_threshold(),
            volume_spike_multiple: default_volume_spike_multiple(),
            error_rate_threshold: default_error_rate_threshold(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
    #[serde(default = "default_status_check_interval_secs")]
    pub status_check_interval_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_order_timeout_secs() -> u64 {
    30
}
fn default_status_check_interval_secs() -> u64 {
    5
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            order_timeout_secs: default_order_timeout_secs(),
            status_check_interval_secs: default_status_check_interval_secs(),
        }
    }
}

/// Per-symbol overrides for the handful of settings that commonly vary by
/// instrument (tick size, position cap, price-distance gate).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolOverride {
    #[serde(default)]
    pub max_position_size: Option<f64>,
    #[serde(default)]
    pub max_price_distance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_vwap_window_secs")]
    pub vwap_window_secs: u64,
    #[serde(default = "default_vwap_size")]
    pub vwap_size: usize,
    #[serde(default = "default_tick_size")]
    pub tick_size: usize,

    #[serde(default = "default_base_size_ratio")]
    pub base_size_ratio: f64,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_price_distance")]
    pub max_price_distance: f64,
    #[serde(default = "default_max_drawdown_protection")]
    pub max_drawdown_protection: f64,

    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    #[serde(default = "default_commission")]
    pub commission: f64,

    #[serde(default = "default_prob_threshold")]
    pub prob_threshold: f64,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_rest_timeout_secs")]
    pub rest_timeout_secs: u64,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub order: OrderSettings,

    #[serde(default)]
    pub per_symbol_overrides: HashMap<String, SymbolOverride>,

    #[serde(default = "default_true")]
    pub dry_run: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            api_key: String::new(),
            api_secret: String::new(),
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            symbols: default_symbols(),
            vwap_window_secs: default_vwap_window_secs(),
            vwap_size: default_vwap_size(),
            tick_size: default_tick_size(),
            base_size_ratio: default_base_size_ratio(),
            max_position_size: default_max_position_size(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_price_distance: default_max_price_distance(),
            max_drawdown_protection: default_max_drawdown_protection(),
            initial_capital: default_initial_capital(),
            commission: default_commission(),
            prob_threshold: default_prob_threshold(),
            metrics_port: default_metrics_port(),
            ping_interval_secs: default_ping_interval_secs(),
            rest_timeout_secs: default_rest_timeout_secs(),
            circuit_breaker: CircuitBreakerSettings::default(),
            order: OrderSettings::default(),
            per_symbol_overrides: HashMap::new(),
            dry_run: true,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config from {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content).with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.apply_env_overrides();
        info!(path = %path.display(), symbols = ?config.symbols, dry_run = config.dry_run, "config loaded");
        Ok(config)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to load config, using defaults");
                let mut c = Self::default();
                c.apply_env_overrides();
                c
            }
        }
    }

    /// Overlay environment variables on top of the loaded config. Credentials
    /// live in the environment, never in the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("EXCHANGE_API_KEY") {
            self.api_key = key;
        }
        if let Ok(secret) = std::env::var("EXCHANGE_API_SECRET") {
            self.api_secret = secret;
        }
        if let Ok(syms) = std::env::var("ENGINE_SYMBOLS") {
            self.symbols = syms.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect();
        }
        // Live trading requires an explicit, separate opt-in beyond setting
        // account_mode — a config file alone can never enable live orders.
        if self.account_mode == AccountMode::Live && std::env::var("ENGINE_LIVE_TRADING_CONFIRMED").as_deref() != Ok("yes") {
            warn!("account_mode=Live requested but ENGINE_LIVE_TRADING_CONFIRMED != yes — forcing dry_run");
            self.dry_run = true;
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path).with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Validate named fields, returning the first violation found.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbols.is_empty() {
            return Err(EngineError::ConfigInvalid { field: "symbols".into(), reason: "must not be empty".into() });
        }
        for symbol in &self.symbols {
            if !(3..=20).contains(&symbol.len()) {
                return Err(EngineError::ConfigInvalid { field: "symbols".into(), reason: format!("{symbol:?} must be 3-20 characters") });
            }
        }
        if self.vwap_window_secs == 0 {
            return Err(EngineError::ConfigInvalid { field: "vwap_window_secs".into(), reason: "must be positive".into() });
        }
        if self.vwap_size == 0 {
            return Err(EngineError::ConfigInvalid { field: "vwap_size".into(), reason: "must be positive".into() });
        }
        if !(1..=1000).contains(&self.tick_size) {
            return Err(EngineError::ConfigInvalid { field: "tick_size".into(), reason: "must be in [1, 1000]".into() });
        }
        if self.max_price_distance <= 0.0 || self.max_price_distance > 10.0 {
            return Err(EngineError::ConfigInvalid { field: "max_price_distance".into(), reason: "must be in (0, 10]".into() });
        }
        if !(1024..=65535).contains(&self.metrics_port) {
            return Err(EngineError::ConfigInvalid { field: "metrics_port".into(), reason: "must be in [1024, 65535]".into() });
        }
        if !(1..=300).contains(&self.ping_interval_secs) {
            return Err(EngineError::ConfigInvalid { field: "ping_interval_secs".into(), reason: "must be in [1s, 5m]".into() });
        }
        if !(1..=60).contains(&self.rest_timeout_secs) {
            return Err(EngineError::ConfigInvalid { field: "rest_timeout_secs".into(), reason: "must be in [1s, 1m]".into() });
        }
        if self.base_size_ratio <= 0.0 || self.base_size_ratio > 0.1 {
            return Err(EngineError::ConfigInvalid { field: "base_size_ratio".into(), reason: "must be in (0, 0.1]".into() });
        }
        if self.max_position_size <= 0.0 || self.max_position_size > 0.2 {
            return Err(EngineError::ConfigInvalid { field: "max_position_size".into(), reason: "must be in (0, 0.2]".into() });
        }
        if self.max_daily_loss_pct <= 0.0 || self.max_daily_loss_pct > 0.5 {
            return Err(EngineError::ConfigInvalid { field: "max_daily_loss_pct".into(), reason: "must be in (0, 0.5]".into() });
        }
        if !(0.5..=0.99).contains(&self.prob_threshold) {
            return Err(EngineError::ConfigInvalid { field: "prob_threshold".into(), reason: "must be in [0.5, 0.99]".into() });
        }
        if !(0.0..=1.0).contains(&self.max_drawdown_protection) {
            return Err(EngineError::ConfigInvalid { field: "max_drawdown_protection".into(), reason: "must be in [0, 1]".into() });
        }
        if self.account_mode == AccountMode::Live && (self.api_key.is_empty() || self.api_secret.is_empty()) {
            return Err(EngineError::ConfigInvalid { field: "api_key/api_secret".into(), reason: "required when account_mode is Live".into() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn empty_symbols_rejected() {
        let mut c = Config::default();
        c.symbols.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn symbol_too_short_rejected() {
        let mut c = Config::default();
        c.symbols = vec!["BT".into()];
        assert!(c.validate().is_err());
    }

    #[test]
    fn max_position_size_above_cap_rejected() {
        let mut c = Config::default();
        c.max_position_size = 0.21;
        assert!(c.validate().is_err());
    }

    #[test]
    fn base_size_ratio_above_cap_rejected() {
        let mut c = Config::default();
        c.base_size_ratio = 0.11;
        assert!(c.validate().is_err());
    }

    #[test]
    fn prob_threshold_below_floor_rejected() {
        let mut c = Config::default();
        c.prob_threshold = 0.4;
        assert!(c.validate().is_err());
    }

    #[test]
    fn metrics_port_below_floor_rejected() {
        let mut c = Config::default();
        c.metrics_port = 80;
        assert!(c.validate().is_err());
    }

    #[test]
    fn live_mode_requires_credentials() {
        let mut c = Config::default();
        c.account_mode = AccountMode::Live;
        assert!(c.validate().is_err());
        c.api_key = "k".into();
        c.api_secret = "s".into();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"] }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.vwap_size, 600);
        assert!(cfg.dry_run);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.max_position_size, cfg2.max_position_size);
    }
}
