use axum::{routing::get, Router};

use crate::state::AppState;
use crate::ws;

/// Build the axum Router: the chat endpoint at the configured path plus a
/// health check.
pub fn build_router(state: AppState, endpoint: &str) -> Router {
    Router::new()
        .route(endpoint, get(ws::handler::ws_upgrade))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
