// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billgate Billing Module
//!
//! Keeps one subscription record per user in sync with Stripe and decides
//! whether a user may reach protected resources.
//!
//! ## Features
//!
//! - **Access Guard**: pure allow/deny decision over account, record and time
//! - **Webhooks**: signed, idempotent synchronisation of subscription lifecycle events
//! - **Checkout**: hosted subscription checkout with optional trial
//! - **Cancellation**: cancel at period end, status left to the provider
//! - **Reconciliation**: re-sync from the provider on demand or on a schedule

pub mod checkout;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod models;
pub mod provider;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Checkout
pub use checkout::{
    CheckoutConfirmation, CheckoutInfo, CheckoutService, CheckoutStart, CheckoutState,
};

// Client
pub use client::{validate_price_id, StripeClient, StripeConfig};

// Entitlement
pub use entitlement::{evaluate_access, AccessDecision, AllowReason, DenyReason};

// Error
pub use error::{BillingError, BillingResult};

// Models
pub use models::{ApplyOutcome, SubscriptionRecord, SubscriptionStatus, SubscriptionUpdate};

// Provider
pub use provider::{CheckoutRequest, CheckoutSessionInfo, PaymentProvider, SubscriptionSnapshot};

// Store
pub use store::{
    EventLedger, EventProcessingResult, InMemoryStore, PgStore, SubscriptionStore,
    WebhookEventRecord,
};

// Subscriptions
pub use subscriptions::{ReconcileReport, SubscriptionService, SubscriptionSummary, SyncReport};

// Webhooks
pub use webhooks::{verify_signature, WebhookHandler, WebhookOutcome};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: Arc<SubscriptionService>,
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables, backed by Postgres
    pub fn from_env(pool: PgPool, public_base_url: &str) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let store = Arc::new(PgStore::new(pool));
        let provider = Arc::new(StripeClient::new(config.clone()));

        Ok(Self::new(
            store.clone(),
            store,
            provider,
            config,
            public_base_url,
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn EventLedger>,
        provider: Arc<dyn PaymentProvider>,
        config: StripeConfig,
        public_base_url: &str,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionService::new(store.clone(), provider.clone()));
        let webhooks = WebhookHandler::new(
            subscriptions.clone(),
            ledger,
            config.webhook_secret.clone(),
        );
        let checkout = CheckoutService::new(store, provider, config, public_base_url);

        Self {
            subscriptions,
            checkout,
            webhooks,
        }
    }
}
