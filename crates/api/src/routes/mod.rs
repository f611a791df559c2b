//! HTTP routes

pub mod subscription;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;

use crate::middleware::entitlement_gate;
use crate::state::AppState;

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the application router. The entitlement gate wraps the whole tree
/// (classification exempts health, webhooks, and the subscription routes),
/// so platform routes mounted under `/api` later are gated automatically.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(webhooks::handle_webhook))
        .route("/api/subscription", get(subscription::get_subscription))
        .route(
            "/api/subscription/manage",
            post(subscription::manage_subscription),
        )
        .route("/api/subscription/usage", get(subscription::get_usage))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            entitlement_gate,
        ))
        .with_state(state)
}
