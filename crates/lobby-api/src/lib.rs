pub mod handlers;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Client-facing routes: the WebSocket endpoint only.
pub fn public_router(state: ApiState) -> Router {
    Router::new()
        .route("/ws", get(handlers::handle_ws))
        .with_state(state)
}

/// Operator routes, nested under `/api`.
pub fn admin_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/status", get(handlers::handle_status))
        .route("/queue", get(handlers::handle_queue))
        .route(
            "/invites",
            get(handlers::handle_invite_list).post(handlers::handle_invite_issue),
        )
        .route("/session/end", post(handlers::handle_session_end))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve the WebSocket endpoint. The peer address is the rate-limit key.
pub async fn serve_public(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "client endpoint listening");
    axum::serve(
        listener,
        public_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Serve the admin API on 127.0.0.1.
pub async fn serve_admin(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, admin_router(state)).await?;
    Ok(())
}
