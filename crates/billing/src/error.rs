//! Billing error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe is not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid billing configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
