//! Test doubles shared by this crate's tests and downstream crates
//! (enabled with the `test-support` feature)

use std::collections::HashMap;

use async_trait::async_trait;
use billgate_shared::Account;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{CheckoutRequest, CheckoutSessionInfo, PaymentProvider, SubscriptionSnapshot};

/// A regular (non-elevated) account
pub fn account(email: &str) -> Account {
    Account {
        id: Uuid::new_v4(),
        email: email.to_string(),
        is_staff: false,
        is_superuser: false,
        is_active: true,
        date_joined: OffsetDateTime::now_utc(),
    }
}

/// `Stripe-Signature` header value for `payload` signed at `timestamp`
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

#[derive(Default)]
struct MockState {
    subscriptions: HashMap<String, SubscriptionSnapshot>,
    sessions: HashMap<String, CheckoutSessionInfo>,
    customers: Vec<(String, Uuid)>,
    checkout_requests: Vec<CheckoutRequest>,
    cancel_calls: Vec<String>,
    pending_failures: u32,
}

impl MockState {
    fn take_failure(&mut self) -> BillingResult<()> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(BillingError::StripeApi("simulated provider outage".to_string()));
        }
        Ok(())
    }
}

/// In-process payment provider recording every call
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_subscription(&self, snapshot: SubscriptionSnapshot) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(snapshot.id.clone(), snapshot);
    }

    pub async fn put_session(&self, session: CheckoutSessionInfo) {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    /// Make the next `count` provider calls fail
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.pending_failures = count;
    }

    pub async fn customers(&self) -> Vec<(String, Uuid)> {
        self.state.lock().await.customers.clone()
    }

    pub async fn checkout_requests(&self) -> Vec<CheckoutRequest> {
        self.state.lock().await.checkout_requests.clone()
    }

    pub async fn cancel_calls(&self) -> Vec<String> {
        self.state.lock().await.cancel_calls.clone()
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn create_customer(&self, _email: &str, user_id: Uuid) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        let id = format!("cus_mock_{}", state.customers.len() + 1);
        state.customers.push((id.clone(), user_id));
        Ok(id)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionInfo> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        let id = format!("cs_mock_{}", state.checkout_requests.len() + 1);
        let session = CheckoutSessionInfo {
            id: id.clone(),
            url: Some(format!("https://checkout.stripe.test/c/pay/{}", id)),
            customer_id: Some(request.customer_id.clone()),
            subscription_id: None,
            paid: false,
        };
        state.checkout_requests.push(request.clone());
        state.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionInfo> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("No such checkout session: {}", session_id)))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: {}", subscription_id)))
    }

    async fn cancel_at_period_end(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        let snapshot = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: {}", subscription_id)))?;
        snapshot.cancel_at_period_end = true;
        let snapshot = snapshot.clone();
        state.cancel_calls.push(subscription_id.to_string());
        Ok(snapshot)
    }
}
