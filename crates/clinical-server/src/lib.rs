//! Clinical encounter-note orchestration demonstration server.
//!
//! A thin axum surface exercising `clinical-core`: one `POST /compose` route
//! driving the compose pipeline, one `GET /ws/{channel}` route per encounter
//! delta channel, and a `GET /health` liveness probe. Per the core's scope,
//! HTTP routing itself carries no business logic — it only wires requests
//! onto the library's public API.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the complete axum router wiring `clinical-core` behind HTTP/WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/compose", post(routes::compose::compose))
        .route("/ws/{channel}", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
