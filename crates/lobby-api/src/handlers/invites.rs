//! /invites handlers — mint and audit invite tokens.

use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use lobby_core::InviteScope;
use lobby_services::{InviteRecord, IssuedInvite};

use super::{authorize, ApiState};

// ── /invites (GET) ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct InviteListResponse {
    pub invites: Vec<InviteRecord>,
}

pub async fn handle_invite_list(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<InviteListResponse>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    Ok(Json(InviteListResponse {
        invites: state.invites.list(),
    }))
}

// ── /invites (POST) ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct IssueRequest {
    pub scope: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

pub async fn handle_invite_issue(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<IssueRequest>,
) -> Result<Json<IssuedInvite>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    let scope: InviteScope = req
        .scope
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, e))?;
    let ttl = match req.ttl_secs {
        Some(0) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "ttl_secs must be greater than zero".to_string(),
            ))
        }
        Some(secs) => Duration::from_secs(secs),
        None => state.default_invite_ttl,
    };
    Ok(Json(state.invites.issue(scope, ttl)))
}
