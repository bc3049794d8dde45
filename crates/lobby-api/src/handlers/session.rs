//! /session/end handler — operator stops the active session.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;

use lobby_core::SessionId;

use super::{authorize, broker_gone, ApiState};

#[derive(Serialize)]
pub struct SessionEndResponse {
    /// The session that was told to stop, if any.
    pub ended: Option<SessionId>,
}

pub async fn handle_session_end(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<SessionEndResponse>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    let ended = state.broker.force_end().await.map_err(broker_gone)?;
    if let Some(id) = ended {
        tracing::info!(session = %id, "session ended by operator");
    }
    Ok(Json(SessionEndResponse { ended }))
}
