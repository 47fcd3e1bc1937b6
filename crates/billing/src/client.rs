//! Stripe client and configuration

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus,
    Client, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CreateCustomer, Customer, CustomerId, Expandable,
    Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus, UpdateSubscription,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::SubscriptionStatus;
use crate::provider::{
    CheckoutRequest, CheckoutSessionInfo, PaymentProvider, SubscriptionSnapshot,
    USER_ID_METADATA_KEY,
};

/// Stripe settings read from the environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub publishable_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub price_id: Option<String>,
    pub trial_days: u32,
}

impl StripeConfig {
    /// Load from `STRIPE_*` / `SUBSCRIPTION_*` variables.
    ///
    /// Returns `NotConfigured` when no secret key is set; the rest of the
    /// settings are optional and checked where they are used.
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = non_empty_var("STRIPE_SECRET_KEY")
            .ok_or_else(|| BillingError::NotConfigured("STRIPE_SECRET_KEY not set".to_string()))?;

        let trial_days = match non_empty_var("SUBSCRIPTION_TRIAL_DAYS") {
            Some(raw) => raw.parse::<u32>().map_err(|e| {
                BillingError::InvalidConfiguration(format!(
                    "SUBSCRIPTION_TRIAL_DAYS must be a non-negative integer: {}",
                    e
                ))
            })?,
            None => 0,
        };

        Ok(Self {
            secret_key,
            publishable_key: non_empty_var("STRIPE_PUBLISHABLE_KEY"),
            webhook_secret: non_empty_var("STRIPE_WEBHOOK_SECRET"),
            price_id: non_empty_var("SUBSCRIPTION_PRICE_ID"),
            trial_days,
        })
    }

    /// The configured subscription price, rejecting product ids
    pub fn require_price_id(&self) -> BillingResult<&str> {
        let price_id = self.price_id.as_deref().ok_or_else(|| {
            BillingError::NotConfigured("SUBSCRIPTION_PRICE_ID not set".to_string())
        })?;
        validate_price_id(price_id)?;
        Ok(price_id)
    }

    pub fn trial_period_days(&self) -> Option<u32> {
        (self.trial_days > 0).then_some(self.trial_days)
    }
}

/// A product id (`prod_...`) is a common misconfiguration for the price id
pub fn validate_price_id(price_id: &str) -> BillingResult<()> {
    if price_id.starts_with("prod_") {
        return Err(BillingError::InvalidConfiguration(format!(
            "SUBSCRIPTION_PRICE_ID is a product id ({}); use a price id (price_...)",
            price_id
        )));
    }
    Ok(())
}

fn non_empty_var(key: &str) -> Option<String> {
    dotenvy::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Thin wrapper over the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))
}

fn timestamp(value: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value).ok()
}

fn map_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    }
}

fn snapshot(subscription: &Subscription) -> SubscriptionSnapshot {
    let customer_id = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };

    SubscriptionSnapshot {
        id: subscription.id.to_string(),
        customer_id: Some(customer_id),
        status: map_status(subscription.status),
        current_period_start: timestamp(subscription.current_period_start),
        current_period_end: timestamp(subscription.current_period_end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        trial_end: subscription.trial_end.and_then(timestamp),
        ended_at: subscription.ended_at.and_then(timestamp),
        user_id: subscription
            .metadata
            .get(USER_ID_METADATA_KEY)
            .and_then(|id| Uuid::parse_str(id).ok()),
    }
}

fn session_info(session: &CheckoutSession) -> CheckoutSessionInfo {
    CheckoutSessionInfo {
        id: session.id.to_string(),
        url: session.url.clone(),
        customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
        subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
        paid: session.payment_status == CheckoutSessionPaymentStatus::Paid,
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_customer(&self, email: &str, user_id: Uuid) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert(USER_ID_METADATA_KEY.to_string(), user_id.to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(&self.inner, params).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created new Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionInfo> {
        let customer_id = request
            .customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))?;

        let mut metadata = HashMap::new();
        metadata.insert(USER_ID_METADATA_KEY.to_string(), request.user_id.to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.customer = Some(customer_id);
        params.success_url = Some(request.success_url.as_str());
        params.cancel_url = Some(request.cancel_url.as_str());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            trial_period_days: request.trial_period_days,
            metadata: Some(metadata),
            ..Default::default()
        });

        let session = CheckoutSession::create(&self.inner, params).await?;

        tracing::info!(
            user_id = %request.user_id,
            session_id = %session.id,
            trial_period_days = ?request.trial_period_days,
            "Created checkout session"
        );

        Ok(session_info(&session))
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionInfo> {
        let id = session_id
            .parse::<CheckoutSessionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid checkout session ID: {}", e)))?;
        let session = CheckoutSession::retrieve(&self.inner, &id, &[]).await?;
        Ok(session_info(&session))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id = parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(&self.inner, &id, &[]).await?;
        Ok(snapshot(&subscription))
    }

    async fn cancel_at_period_end(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id = parse_subscription_id(subscription_id)?;
        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };
        let subscription = Subscription::update(&self.inner, &id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            period_end = subscription.current_period_end,
            "Subscription set to cancel at period end"
        );

        Ok(snapshot(&subscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(price_id: Option<&str>, trial_days: u32) -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            publishable_key: Some("pk_test_123".to_string()),
            webhook_secret: Some("whsec_test".to_string()),
            price_id: price_id.map(str::to_string),
            trial_days,
        }
    }

    #[test]
    fn test_product_id_is_rejected_as_price() {
        let err = config(Some("prod_ABC"), 0).require_price_id().unwrap_err();
        assert!(matches!(err, BillingError::InvalidConfiguration(_)));
        assert_eq!(
            config(Some("price_ABC"), 0).require_price_id().unwrap(),
            "price_ABC"
        );
    }

    #[test]
    fn test_only_product_prefix_is_rejected() {
        assert!(validate_price_id("prod_ABC").is_err());
        // Legacy plan ids are still valid prices
        assert!(validate_price_id("plan_monthly").is_ok());
        assert!(validate_price_id("price_1Nabc").is_ok());
    }

    #[test]
    fn test_missing_price_is_not_configured() {
        let err = config(None, 0).require_price_id().unwrap_err();
        assert!(matches!(err, BillingError::NotConfigured(_)));
    }

    #[test]
    fn test_trial_days_only_when_positive() {
        assert_eq!(config(None, 0).trial_period_days(), None);
        assert_eq!(config(None, 14).trial_period_days(), Some(14));
    }

    #[test]
    fn test_status_mapping_covers_provider_statuses() {
        assert_eq!(map_status(StripeSubStatus::Trialing), SubscriptionStatus::Trialing);
        assert_eq!(map_status(StripeSubStatus::PastDue), SubscriptionStatus::PastDue);
        assert_eq!(
            map_status(StripeSubStatus::IncompleteExpired),
            SubscriptionStatus::IncompleteExpired
        );
    }
}
