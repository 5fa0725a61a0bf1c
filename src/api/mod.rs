// =============================================================================
// HTTP / WebSocket surface — axum router
// =============================================================================
//
// Routes:
//   POST /webhook      — authenticated signal ingress (HMAC + source)
//   GET  /ws/status    — push-only operational events
//   GET  /ws/console   — operator console feed (batched/delta/compressed)
//   GET  /health       — public liveness probe
//   POST /admin/control — operator actions, HMAC-authenticated like signals
// =============================================================================

pub mod console;
pub mod status_ws;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook::webhook_handler))
        .route("/ws/status", get(status_ws::status_ws_handler))
        .route("/ws/console", get(console::console_ws_handler))
        .route("/admin/control", post(admin_control))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health (public)
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": crate::types::now_ms(),
        "master_arm": state.arm.is_armed(),
        "feed_connected": state.cache.feed_connected(),
    }))
}

// ---------------------------------------------------------------------------
// Operator controls (HMAC-authenticated)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AdminAction {
    Arm,
    Disarm,
    ResetDms,
    ResetGuard,
    ReloadConfig,
    SetMarketOpen { open: bool },
}

#[derive(Debug, Deserialize)]
struct AdminRequest {
    action: AdminAction,
}

async fn admin_control(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let cfg = state.config.current();
    if let Err(e) =
        webhook::verify_request(&cfg.hmac_secret, &cfg.allowed_sources, &headers, &body)
    {
        warn!(code = e.code(), "admin request rejected at auth");
        return (
            e.status(),
            Json(serde_json::json!({ "error": e.code(), "message": e.message() })),
        );
    }

    let request: AdminRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "INVALID_PAYLOAD", "message": e.to_string() })),
            );
        }
    };

    info!(action = ?request.action, "admin control");
    let detail = match request.action {
        AdminAction::Arm => {
            state.arm.set(true, "operator");
            serde_json::json!({ "master_arm": true })
        }
        AdminAction::Disarm => {
            state.arm.set(false, "operator");
            serde_json::json!({ "master_arm": false })
        }
        AdminAction::ResetDms => {
            state.heartbeat.reset();
            serde_json::json!({ "dms": "reset" })
        }
        AdminAction::ResetGuard => {
            state.drift.reset();
            state.gates.reset();
            serde_json::json!({ "guards": "reset" })
        }
        AdminAction::ReloadConfig => match state.config.reload_from_env() {
            Ok(_) => serde_json::json!({ "config": "reloaded" }),
            Err(problems) => {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(serde_json::json!({
                        "error": "CONFIG_INVALID",
                        "problems": problems,
                    })),
                );
            }
        },
        AdminAction::SetMarketOpen { open } => {
            state.heartbeat.set_market_open(open);
            serde_json::json!({ "market_open": open })
        }
    };
    state.increment_version();

    (StatusCode::OK, Json(serde_json::json!({ "status": "ok", "detail": detail })))
}
