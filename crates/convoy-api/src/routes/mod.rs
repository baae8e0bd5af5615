//! API routes.

pub mod deployments;
pub mod health;

use axum::Router;

use crate::AppState;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/deployments", deployments::router())
        .merge(health::router())
        .with_state(state)
}
