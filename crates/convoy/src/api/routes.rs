//! Route table.

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{handlers, AppState};
use crate::ws;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/conversation/{id}", get(handlers::get_conversation))
        .route("/api/repositories", get(handlers::list_repositories))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
