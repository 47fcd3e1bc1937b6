//! Unit tests for authentication and subscription guard middleware
//!
//! Tests cover:
//! - Token extraction (header, cookie, missing, invalid)
//! - Account checks (unknown, disabled)
//! - Subscription guard (elevated roles, active, elapsed, denied responses)

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use billgate_billing::{SubscriptionRecord, SubscriptionStatus, SubscriptionStore};
use time::{Duration, OffsetDateTime};

use super::middleware::{AUTH_COOKIE_NAME, SUBSCRIPTION_REQUIRED_PATH};
use crate::test_support::{body_json, TestApp};

const GUARDED: &str = "/api/v1/workspace";

fn request_with_token(token: &str) -> Request<Body> {
    Request::get(GUARDED)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = TestApp::new();
    let response = app
        .send(Request::get(GUARDED).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_garbage_token_is_unauthorized() {
    let app = TestApp::new();
    let response = app.send(request_with_token("not-a-jwt")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_account_is_unauthorized() {
    let app = TestApp::new();
    let token = app
        .state
        .jwt_manager
        .generate_token(uuid::Uuid::new_v4(), "ghost@example.com")
        .unwrap();

    let response = app.send(request_with_token(&token)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_disabled_account_is_unauthorized() {
    let app = TestApp::new();
    let mut disabled = billgate_billing::testing::account("disabled@example.com");
    disabled.is_active = false;
    disabled.is_staff = true;
    let (_, token) = app.add_account(disabled).await;

    let response = app.send(request_with_token(&token)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_cookie_token_accepted() {
    let app = TestApp::new();
    let (user, token) = app.user("cookie@example.com").await;
    app.activate(user.id, "sub_cookie").await;

    let response = app
        .send(
            Request::get(GUARDED)
                .header(header::COOKIE, format!("theme=dark; {}={}", AUTH_COOKIE_NAME, token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["email"], "cookie@example.com");
}

// =============================================================================
// Subscription guard
// =============================================================================

#[tokio::test]
async fn test_no_subscription_gets_json_402() {
    let app = TestApp::new();
    let (user, token) = app.user("free@example.com").await;

    let response = app.send(request_with_token(&token)).await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response).await;
    assert_eq!(body["error"], "subscription_required");
    assert_eq!(body["subscription_url"], SUBSCRIPTION_REQUIRED_PATH);

    // The guard only reads
    assert!(app.store.find_by_user(user.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_browser_is_redirected() {
    let app = TestApp::new();
    let (_, token) = app.user("browser@example.com").await;

    let response = app
        .send(
            Request::get(GUARDED)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(header::ACCEPT, "text/html,application/xhtml+xml")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        SUBSCRIPTION_REQUIRED_PATH
    );
}

#[tokio::test]
async fn test_staff_bypasses_guard() {
    let app = TestApp::new();
    let (_, token) = app.staff("staff@example.com").await;

    let response = app.send(request_with_token(&token)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_superuser_bypasses_guard() {
    let app = TestApp::new();
    let mut admin = billgate_billing::testing::account("root@example.com");
    admin.is_superuser = true;
    let (_, token) = app.add_account(admin).await;

    let response = app.send(request_with_token(&token)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_elapsed_period_denied() {
    let app = TestApp::new();
    let (user, token) = app.user("lapsed@example.com").await;

    let mut record = SubscriptionRecord::new(user.id);
    record.status = SubscriptionStatus::Active;
    record.current_period_end = Some(OffsetDateTime::now_utc() - Duration::hours(1));
    app.store.put_subscription(record).await;

    let response = app.send(request_with_token(&token)).await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
}

#[tokio::test]
async fn test_trialing_allowed() {
    let app = TestApp::new();
    let (user, token) = app.user("trial@example.com").await;

    let mut record = SubscriptionRecord::new(user.id);
    record.status = SubscriptionStatus::Trialing;
    record.current_period_end = Some(OffsetDateTime::now_utc() + Duration::days(7));
    app.store.put_subscription(record).await;

    let response = app.send(request_with_token(&token)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_past_due_denied() {
    let app = TestApp::new();
    let (user, token) = app.user("pastdue@example.com").await;

    let mut record = SubscriptionRecord::new(user.id);
    record.status = SubscriptionStatus::PastDue;
    record.current_period_end = Some(OffsetDateTime::now_utc() + Duration::days(7));
    app.store.put_subscription(record).await;

    let response = app.send(request_with_token(&token)).await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
}

#[tokio::test]
async fn test_subscription_pages_reachable_without_subscription() {
    let app = TestApp::new();
    let (_, token) = app.user("pages@example.com").await;

    for uri in ["/subscription", SUBSCRIPTION_REQUIRED_PATH, "/subscription/checkout"] {
        let response = app.get(uri, &token).await;
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
    }
}
