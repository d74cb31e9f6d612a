// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// All endpoints live under `/api/v1/`. Only `/api/v1/health` is public; every
// other route requires a valid Bearer token via the `AuthBearer` extractor.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::{AccountMode, TradingMode};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/trades/stats", get(trade_stats))
        .route("/api/v1/orders/pending", get(pending_orders))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/reset-daily", post(control_reset_daily))
        .route("/api/v1/control/account-mode", post(control_account_mode))
        .route("/api/v1/heartbeat", post(heartbeat))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.get_open_positions())
}

async fn trades(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.position_manager.get_closed_trades(500))
}

async fn trade_stats(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.build_snapshot();
    match snapshot.journal_stats {
        Some(stats) => Json(serde_json::to_value(stats).unwrap_or_default()),
        None => Json(serde_json::json!({ "total_trades": 0, "win_rate": 0.0, "total_net_pnl": 0.0, "profit_factor": 0.0 })),
    }
}

async fn pending_orders(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.order_tracker.snapshot())
}

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.config.write().trading_mode = TradingMode::Paused;
    state.increment_version();
    info!("trading paused via api");
    Json(ControlResponse { trading_mode: "Paused".into(), message: "trading paused".into() })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.config.write().trading_mode = TradingMode::Live;
    state.increment_version();
    info!("trading resumed via api");
    Json(ControlResponse { trading_mode: "Live".into(), message: "trading resumed".into() })
}

async fn control_kill(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.config.write().trading_mode = TradingMode::Killed;
    state.risk_engine.kill();
    state.increment_version();
    warn!("trading killed via api");
    Json(ControlResponse { trading_mode: "Killed".into(), message: "trading killed — manual restart required".into() })
}

async fn control_reset_daily(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.risk_engine.reset_daily();
    state.increment_version();
    info!("daily risk counters reset via api");
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct AccountModeRequest {
    account_mode: String,
    #[serde(default)]
    confirm_live: bool,
}

#[derive(Serialize)]
struct AccountModeResponse {
    account_mode: String,
}

async fn control_account_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountModeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mode = match req.account_mode.to_lowercase().as_str() {
        "demo" => AccountMode::Demo,
        "live" => {
            if !req.confirm_live {
                return Err((StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": "switching to live mode requires confirm_live: true" }))));
            }
            warn!("switching to live account mode via api");
            AccountMode::Live
        }
        other => {
            return Err((StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": format!("invalid account mode: '{other}'. use 'demo' or 'live'.") }))));
        }
    };

    state.config.write().account_mode = mode;
    state.increment_version();
    info!(account_mode = %mode, "account mode changed via api");
    Ok(Json(AccountModeResponse { account_mode: mode.to_string() }))
}

async fn heartbeat(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.last_ws_user_event.write() = std::time::Instant::now();
    state.increment_version();
    Json(serde_json::json!({ "status": "ok", "server_time": chrono::Utc::now().timestamp_millis() }))
}
