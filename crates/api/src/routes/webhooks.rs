//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// POST /webhooks/stripe
///
/// 400 when the payload cannot be trusted or parsed; 500 when processing
/// failed so Stripe redelivers.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let Some(billing) = state.billing_service() else {
        tracing::warn!("Webhook received but Stripe billing is not configured");
        return Err(ApiError::BadRequest("Webhook not configured".to_string()));
    };

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok());

    let event = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Rejected webhook");
        ApiError::BadRequest("Invalid webhook".to_string())
    })?;

    let outcome = billing
        .webhooks
        .handle_event(&event)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "received": true,
        "outcome": outcome
    })))
}
