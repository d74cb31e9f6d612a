// =============================================================================
// Nexus Futures Agent — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Operators must
// explicitly switch to Live mode via the REST control API, and even then
// `ENGINE_LIVE_TRADING_CONFIRMED=yes` must be set in the environment or the
// config layer forces dry_run regardless.
// =============================================================================

mod api;
mod app_state;
mod config;
mod error;
mod exchange;
mod execution;
mod features;
mod metrics;
mod model;
mod orchestrator;
mod order_tracker;
mod persistence;
mod position_engine;
mod predictor;
mod risk;
mod stream;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::execution::{ExecutionConfig, ExecutionEngine};
use crate::order_tracker::{OrderTracker, OrderTrackerConfig};
use crate::orchestrator::Orchestrator;
use crate::persistence::{JsonlPersistence, NullPersistence, Persistence};
use crate::position_engine::PositionManager;
use crate::predictor::{CachingPredictor, HeuristicPredictor, Predictor, SubprocessPredictor};
use crate::risk::{CircuitBreakerConfig, RiskEngine};

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("nexus futures agent starting up");

    let mut config = Config::load_or_default(CONFIG_PATH);
    if let Err(e) = config.validate() {
        error!(error = %e, "config failed validation — refusing to start");
        return Err(e.into());
    }

    info!(
        symbols = ?config.symbols,
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        dry_run = config.dry_run,
        "engine configured"
    );

    let metrics_port = config.metrics_port;
    if let Err(e) = metrics::install(metrics_port) {
        warn!(error = %e, "failed to install metrics exporter — continuing without it");
    } else {
        info!(port = metrics_port, "prometheus metrics exporter listening");
    }

    let shutdown = CancellationToken::new();

    // ── Exchange client ──────────────────────────────────────────────────
    let client = Arc::new(ExchangeClient::new(config.api_key.clone(), config.api_secret.clone(), config.base_url.clone()));

    // ── Core subsystems ──────────────────────────────────────────────────
    let order_tracker = Arc::new(OrderTracker::new(OrderTrackerConfig {
        max_retries: config.order.max_retries,
        retry_backoff: Duration::from_millis(config.order.retry_backoff_ms),
        order_timeout: Duration::from_secs(config.order.order_timeout_secs),
        status_check_interval: Duration::from_secs(config.order.status_check_interval_secs),
    }));

    let position_manager = Arc::new(PositionManager::new());

    let breaker_config = CircuitBreakerConfig {
        volatility_threshold: config.circuit_breaker.volatility_threshold,
        imbalance_threshold: config.circuit_breaker.imbalance_threshold,
        volume_spike_multiple: config.circuit_breaker.volume_spike_multiple,
        error_rate_threshold: config.circuit_breaker.error_rate_threshold,
        failure_threshold: config.circuit_breaker.failure_threshold,
        recovery_timeout: Duration::from_secs(config.circuit_breaker.recovery_timeout_secs),
    };
    let risk_engine = Arc::new(RiskEngine::new(config.initial_capital, config.max_daily_loss_pct, config.max_drawdown_protection, breaker_config));

    let execution_config = ExecutionConfig {
        account_risk: config.base_size_ratio,
        max_position_size: config.max_position_size,
        commission: config.commission,
        dry_run: config.dry_run,
        ..ExecutionConfig::default()
    };
    let execution = Arc::new(ExecutionEngine::new(client.clone(), order_tracker.clone(), position_manager.clone(), risk_engine.clone(), execution_config));

    // ── Predictor stack: subprocess model, falling back to a deterministic
    // heuristic when the model is unavailable or past its deadline, wrapped
    // in a short TTL cache to absorb duplicate feature vectors within a
    // burst of depth events. ──
    let predictor: Arc<dyn Predictor> = match std::env::var("PREDICTOR_COMMAND") {
        Ok(command) => {
            let subprocess = SubprocessPredictor::new(command, Vec::new(), Duration::from_millis(200));
            let heuristic = HeuristicPredictor::new(0.3);
            Arc::new(CachingPredictor::new(subprocess, heuristic, Duration::from_secs(2)))
        }
        Err(_) => {
            info!("PREDICTOR_COMMAND not set — running on the heuristic predictor only");
            Arc::new(HeuristicPredictor::new(0.3))
        }
    };

    let persistence: Arc<dyn Persistence> = match std::env::var("TRADE_JOURNAL_PATH") {
        Ok(path) => Arc::new(JsonlPersistence::new(path)),
        Err(_) => Arc::new(NullPersistence),
    };

    let app_state = Arc::new(AppState::new(config.clone(), risk_engine.clone(), position_manager.clone(), order_tracker.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        execution.clone(),
        position_manager.clone(),
        order_tracker.clone(),
        risk_engine.clone(),
        predictor,
        persistence,
        app_state.clone(),
    ));

    // ── API server ───────────────────────────────────────────────────────
    let bind_addr = std::env::var("ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let api_state = app_state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "api server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "api server exited with error");
        }
    });

    // ── Order monitor (timeout/reap scan) ───────────────────────────────
    tokio::spawn(order_tracker.clone().run_monitor(client.clone(), shutdown.clone()));

    // ── Orchestrator (stream consumption, signal gate, exit scan) ──────
    orchestrator.clone().spawn(client.clone(), shutdown.clone());

    info!("all subsystems running — waiting for ctrl-c");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    shutdown.cancel();

    orchestrator.close_all(model::ExitReason::EndOfData).await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    // Give spawned tasks a moment to observe cancellation before exit.
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("nexus futures agent shut down complete");
    Ok(())
}
