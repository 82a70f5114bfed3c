//! HTTP route handlers for pulsed.

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod health;
mod relay;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/status", get(health::status))

        // Relay slot service
        .route("/relay", post(relay::relay))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
