//! /health, /status, /daemon/shutdown handlers.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;

use lobby_services::{SessionView, TelemetrySnapshot};

use super::{authorize, broker_gone, ApiState};

// ── /health ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

pub async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

// ── /status ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub active: Option<SessionView>,
    pub last_session: Option<SessionView>,
    pub queue_length: usize,
    pub max_queue_size: usize,
    pub idle_connections: usize,
    pub shutting_down: bool,
    pub telemetry: TelemetrySnapshot,
    pub uptime_secs: u64,
}

pub async fn handle_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    let snap = state.broker.snapshot().await.map_err(broker_gone)?;
    let queue_length = snap
        .queue
        .iter()
        .filter(|e| e.position.is_some())
        .count();

    Ok(Json(StatusResponse {
        active: snap.active,
        last_session: snap.last_session,
        queue_length,
        max_queue_size: snap.max_queue_size,
        idle_connections: snap.idle_connections,
        shutting_down: snap.shutting_down,
        telemetry: snap.telemetry,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ShutdownResponse>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Ok(Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    }))
}
