//! HTTP layer: health endpoint, WebSocket upgrade route, and router
//! composition.

pub mod handlers;

use axum::Router;
use axum::routing::get;

use crate::app_state::AppState;
use crate::ws::handler::ws_handler;

/// Builds the complete router with the system endpoints and `/ws`.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .merge(handlers::system::routes())
        .route("/ws", get(ws_handler))
}
