//! API routes

pub mod health;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::{error::ApiError, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Gateway notifications authenticate by origin or signature, not by session
    let payment_routes = Router::new()
        .route("/payments/webhook", post(webhooks::payment_webhook))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", payment_routes)
        .fallback(|| async { ApiError::NotFound })
        .with_state(state)
}
