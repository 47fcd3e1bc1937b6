//! Hosted checkout
//!
//! Starts a subscription-mode Stripe Checkout session for a user and
//! confirms the landing after payment. Neither path writes `status`; the
//! webhook synchronizer does that once the provider reports the change.

use std::sync::Arc;

use billgate_shared::Account;
use serde::Serialize;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::provider::{CheckoutRequest, PaymentProvider};
use crate::store::SubscriptionStore;

/// What the checkout page needs to know before starting a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutInfo {
    pub configured: bool,
    pub publishable_key: Option<String>,
    pub trial_days: u32,
    /// Set when the price setting is missing or malformed
    pub error: Option<String>,
}

impl CheckoutInfo {
    pub fn not_configured() -> Self {
        Self {
            configured: false,
            publishable_key: None,
            trial_days: 0,
            error: Some("Billing is not configured".to_string()),
        }
    }
}

/// A created checkout session the user should be redirected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutStart {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutState {
    /// Paid (or a subscription is attached); the webhook will activate it
    Activating,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutConfirmation {
    pub state: CheckoutState,
    pub session_id: Option<String>,
}

pub struct CheckoutService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn PaymentProvider>,
    config: StripeConfig,
    public_base_url: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn PaymentProvider>,
        config: StripeConfig,
        public_base_url: impl Into<String>,
    ) -> Self {
        let public_base_url = public_base_url.into().trim_end_matches('/').to_string();
        Self {
            store,
            provider,
            config,
            public_base_url,
        }
    }

    pub fn info(&self) -> CheckoutInfo {
        let error = self.config.require_price_id().err().map(|e| e.to_string());
        CheckoutInfo {
            configured: error.is_none(),
            publishable_key: self.config.publishable_key.clone(),
            trial_days: self.config.trial_days,
            error,
        }
    }

    pub fn success_url(&self) -> String {
        format!(
            "{}/subscription/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.public_base_url
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/subscription", self.public_base_url)
    }

    /// Create a checkout session for the account.
    ///
    /// Reuses the record's customer reference or creates a provider customer
    /// and links it first, so a failed session leaves only the link behind.
    pub async fn start_checkout(&self, account: &Account) -> BillingResult<CheckoutStart> {
        let price_id = self.config.require_price_id()?.to_string();

        let record = self.store.get_or_create(account.id).await?;

        let customer_id = match record.stripe_customer_id {
            Some(customer_id) => customer_id,
            None => {
                let customer_id = self
                    .provider
                    .create_customer(&account.email, account.id)
                    .await?;
                self.store.link_customer(account.id, &customer_id).await?;
                customer_id
            }
        };

        let request = CheckoutRequest {
            user_id: account.id,
            customer_id: customer_id.clone(),
            price_id,
            success_url: self.success_url(),
            cancel_url: self.cancel_url(),
            trial_period_days: self.config.trial_period_days(),
        };

        let session = self
            .provider
            .create_checkout_session(&request)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    user_id = %account.id,
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to create checkout session"
                );
            })?;

        let url = session.url.ok_or_else(|| {
            BillingError::StripeApi("Checkout session returned without a URL".to_string())
        })?;

        tracing::info!(
            user_id = %account.id,
            session_id = %session.id,
            "Checkout session started"
        );

        Ok(CheckoutStart {
            session_id: session.id,
            url,
        })
    }

    /// Check the session the provider redirected back with.
    ///
    /// A session whose customer differs from the user's linked customer is
    /// rejected.
    pub async fn confirm_success(
        &self,
        user_id: Uuid,
        session_id: Option<&str>,
    ) -> BillingResult<CheckoutConfirmation> {
        let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
            return Ok(CheckoutConfirmation {
                state: CheckoutState::Pending,
                session_id: None,
            });
        };

        let session = self.provider.retrieve_checkout_session(session_id).await?;
        let record = self.store.find_by_user(user_id).await?;

        // Only a linked customer can be checked against
        let foreign = match record.as_ref().and_then(|r| r.stripe_customer_id.as_deref()) {
            Some(expected) => session.customer_id.as_deref() != Some(expected),
            None => false,
        };

        if foreign {
            tracing::warn!(
                user_id = %user_id,
                session_id = %session_id,
                "Checkout session does not belong to user"
            );
            return Err(BillingError::NotFound(format!(
                "Checkout session {}",
                session_id
            )));
        }

        let state = if session.paid || session.subscription_id.is_some() {
            CheckoutState::Activating
        } else {
            CheckoutState::Pending
        };

        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            state = ?state,
            "Checkout landing"
        );

        Ok(CheckoutConfirmation {
            state,
            session_id: Some(session.id),
        })
    }
}
