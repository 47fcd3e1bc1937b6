//! In-process application harness for router and middleware tests

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request},
    response::Response,
    Router,
};
use billgate_billing::{
    provider::SubscriptionSnapshot,
    testing::{account, MockProvider},
    BillingService, InMemoryStore, StripeConfig, SubscriptionStatus, SubscriptionUpdate,
    SubscriptionStore,
};
use billgate_shared::Account;
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use uuid::Uuid;

use crate::{config::Config, routes::create_router, state::AppState};

pub const WEBHOOK_SECRET: &str = "whsec_router_tests";

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/billgate_test".to_string(),
        bind_address: "127.0.0.1:0".to_string(),
        public_base_url: "http://localhost:8080".to_string(),
        jwt_secret: "test-jwt-secret-key-for-testing-only".to_string(),
        allowed_origins: vec!["http://localhost:3000".to_string()],
        run_migrations: false,
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub provider: Arc<MockProvider>,
    router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Stripe settings absent: billing routes degrade
    pub fn without_billing() -> Self {
        Self::build(false)
    }

    fn build(with_billing: bool) -> Self {
        let config = test_config();
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());

        let billing = with_billing.then(|| {
            Arc::new(BillingService::new(
                store.clone(),
                store.clone(),
                provider.clone(),
                StripeConfig {
                    secret_key: "sk_test_routes".to_string(),
                    publishable_key: Some("pk_test_routes".to_string()),
                    webhook_secret: Some(WEBHOOK_SECRET.to_string()),
                    price_id: Some("price_routes".to_string()),
                    trial_days: 0,
                },
                &config.public_base_url,
            ))
        });

        let state = AppState::from_parts(config, store.clone(), billing);
        let router = create_router(state.clone());

        Self {
            state,
            store,
            provider,
            router,
        }
    }

    /// Register an account and mint a token for it
    pub async fn add_account(&self, account: Account) -> (Account, String) {
        self.store.insert_account(account.clone()).await;
        let token = self
            .state
            .jwt_manager
            .generate_token(account.id, &account.email)
            .unwrap();
        (account, token)
    }

    pub async fn user(&self, email: &str) -> (Account, String) {
        self.add_account(account(email)).await
    }

    pub async fn staff(&self, email: &str) -> (Account, String) {
        let mut staff = account(email);
        staff.is_staff = true;
        self.add_account(staff).await
    }

    /// Give the user an active subscription known to both store and provider
    pub async fn activate(&self, user_id: Uuid, subscription_id: &str) {
        let now = OffsetDateTime::now_utc();
        let snapshot = SubscriptionSnapshot {
            id: subscription_id.to_string(),
            customer_id: Some(format!("cus_{}", subscription_id)),
            status: SubscriptionStatus::Active,
            current_period_start: Some(now - Duration::days(1)),
            current_period_end: Some(now + Duration::days(29)),
            cancel_at_period_end: false,
            trial_end: None,
            ended_at: None,
            user_id: Some(user_id),
        };
        let update: SubscriptionUpdate = snapshot.to_update(now);
        self.store.apply_update(user_id, &update).await.unwrap();
        self.provider.put_subscription(snapshot).await;
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str, token: &str) -> Response {
        self.send(
            Request::get(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post(&self, uri: &str, token: &str) -> Response {
        self.send(
            Request::post(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
