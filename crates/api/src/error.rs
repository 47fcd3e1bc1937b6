//! API error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use billgate_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Billing is not configured: {0}")]
    BillingNotConfigured(String),

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotConfigured(msg) | BillingError::InvalidConfiguration(msg) => {
                ApiError::BillingNotConfigured(msg)
            }
            BillingError::StripeApi(msg) => ApiError::Provider(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookPayloadInvalid(msg) | BillingError::InvalidInput(msg) => {
                ApiError::BadRequest(msg)
            }
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Provider and database details stay in the logs
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BillingNotConfigured(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Billing is not configured. Please contact support.".to_string(),
            ),
            ApiError::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "Payment provider request failed. Please try again.".to_string(),
            ),
            ApiError::Database(_) | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
