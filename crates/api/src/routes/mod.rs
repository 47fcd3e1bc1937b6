//! HTTP routes

pub mod subscription;
pub mod webhooks;
pub mod workspace;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_active_subscription, require_auth},
    state::AppState,
};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Guarded by the subscription check on top of authentication
    let protected = Router::new()
        .route("/api/v1/workspace", get(workspace::get_workspace))
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_active_subscription,
        ));

    let authenticated = Router::new()
        .route("/subscription", get(subscription::get_status))
        .route("/subscription/required", get(subscription::get_required))
        .route(
            "/subscription/checkout",
            get(subscription::get_checkout_info).post(subscription::start_checkout),
        )
        .route("/subscription/success", get(subscription::get_success))
        .route("/subscription/cancel", post(subscription::cancel))
        .merge(protected)
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(authenticated)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
