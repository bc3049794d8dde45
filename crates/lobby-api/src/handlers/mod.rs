//! HTTP API handlers — broker state as JSON, plus the client WebSocket.

pub mod invites;
pub mod queue;
pub mod session;
pub mod status;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, StatusCode};

use lobby_services::{BrokerError, BrokerHandle, InviteTokenService};

#[derive(Clone)]
pub struct ApiState {
    pub broker: BrokerHandle,
    pub invites: InviteTokenService,
    /// TTL for invites issued without one.
    pub default_invite_ttl: Duration,
    /// Bearer token for `/api/*` (health excepted). None = open.
    pub admin_token: Option<Arc<str>>,
    pub started_at: Instant,
    /// Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Check the `Authorization: Bearer` header against the configured token.
fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    // Compare digests so the check does not leak a matching prefix.
    if blake3::hash(presented.as_bytes()) == blake3::hash(expected.as_bytes()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "missing or wrong admin token".to_string()))
    }
}

fn broker_gone(e: BrokerError) -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use invites::{handle_invite_issue, handle_invite_list};
pub use queue::handle_queue;
pub use session::handle_session_end;
pub use status::{handle_health, handle_shutdown, handle_status};
pub use ws::handle_ws;
