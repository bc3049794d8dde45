//! /queue handler.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;

use lobby_services::QueueEntryView;

use super::{authorize, broker_gone, ApiState};

#[derive(Serialize)]
pub struct QueueResponse {
    pub max_size: usize,
    pub entries: Vec<QueueEntryView>,
}

pub async fn handle_queue(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<QueueResponse>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    let snap = state.broker.snapshot().await.map_err(broker_gone)?;
    Ok(Json(QueueResponse {
        max_size: snap.max_queue_size,
        entries: snap.queue,
    }))
}
