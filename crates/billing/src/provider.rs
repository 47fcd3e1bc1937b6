//! Payment provider seam
//!
//! Outbound calls to the payment provider go through [`PaymentProvider`] so
//! services can run against Stripe in production and an in-process mock in
//! tests.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{SubscriptionStatus, SubscriptionUpdate};

/// Metadata key the service writes on customers, sessions and subscriptions
pub const USER_ID_METADATA_KEY: &str = "user_id";

/// Provider-side view of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    /// `user_id` written into the subscription metadata at checkout
    pub user_id: Option<Uuid>,
}

impl SubscriptionSnapshot {
    /// Convert into a record update observed at `observed_at`
    pub fn to_update(&self, observed_at: OffsetDateTime) -> SubscriptionUpdate {
        SubscriptionUpdate {
            stripe_customer_id: self.customer_id.clone(),
            stripe_subscription_id: Some(self.id.clone()),
            status: Some(self.status),
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: Some(self.cancel_at_period_end),
            trial_end: self.trial_end,
            ..SubscriptionUpdate::new(observed_at)
        }
    }
}

/// Parameters for a hosted subscription checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Only sent when greater than zero
    pub trial_period_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionInfo {
    pub id: String,
    /// Hosted payment page; present for open sessions
    pub url: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub paid: bool,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a provider customer tagged with the user's id; returns the customer id
    async fn create_customer(&self, email: &str, user_id: Uuid) -> BillingResult<String>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionInfo>;

    async fn retrieve_checkout_session(&self, session_id: &str)
        -> BillingResult<CheckoutSessionInfo>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;

    /// Ask the provider to cancel at the end of the current period
    async fn cancel_at_period_end(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;
}
