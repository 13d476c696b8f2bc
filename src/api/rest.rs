// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// This engine has no control surface: there is no position manager, no risk
// engine, nothing to pause/resume/kill. What remains is a read-only
// observability surface over signals, streaks, and configuration.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::api_state::ApiState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/signals/active", get(active_signals))
        .route("/api/v1/streaks", get(streaks))
        .route("/api/v1/config", get(config))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Full state snapshot (authenticated)
// =============================================================================

async fn full_state(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, axum::http::StatusCode> {
    let snapshot = state
        .build_snapshot()
        .await
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(snapshot))
}

// =============================================================================
// Active signals (authenticated)
// =============================================================================

async fn active_signals(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, axum::http::StatusCode> {
    let signals = state
        .signal_store
        .load_active()
        .await
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(signals))
}

// =============================================================================
// Streaks (authenticated)
// =============================================================================

async fn streaks(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, axum::http::StatusCode> {
    let streaks = state
        .streak_store
        .load_all()
        .await
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    let body: std::collections::HashMap<String, crate::types::StreakState> =
        streaks.into_iter().map(|(key, state)| (key.to_string(), state)).collect();
    Ok(Json(body))
}

// =============================================================================
// Configuration (authenticated)
// =============================================================================

async fn config(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let config = state.config.read().clone();
    Json(config)
}
