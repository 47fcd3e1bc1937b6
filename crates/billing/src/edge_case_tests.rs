// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests boundary conditions across the guard, webhook synchronisation and
//! cancellation paths, wired end to end through the in-memory store and the
//! mock provider.

#[cfg(test)]
mod guard_tests {
    use crate::entitlement::{evaluate_access, AccessDecision, AllowReason, DenyReason};
    use crate::models::{SubscriptionRecord, SubscriptionStatus};
    use crate::testing::account;
    use time::macros::datetime;
    use time::Duration;

    // =========================================================================
    // User without a record: denied, not an error
    // =========================================================================
    #[test]
    fn test_user_without_record_denied() {
        let user = account("nobody@example.com");
        let now = datetime!(2025-06-01 00:00 UTC);
        assert_eq!(
            evaluate_access(&user, None, now),
            AccessDecision::Deny(DenyReason::NoSubscription)
        );
    }

    // =========================================================================
    // Elevated account without a record: allowed
    // =========================================================================
    #[test]
    fn test_staff_without_record_allowed() {
        let mut user = account("staff@example.com");
        user.is_staff = true;
        let now = datetime!(2025-06-01 00:00 UTC);
        assert_eq!(
            evaluate_access(&user, None, now),
            AccessDecision::Allow(AllowReason::ElevatedRole)
        );
    }

    // =========================================================================
    // Active one second past period end: denied
    // =========================================================================
    #[test]
    fn test_active_past_period_end_denied() {
        let user = account("late@example.com");
        let now = datetime!(2025-06-01 00:00 UTC);
        let mut record = SubscriptionRecord::new(user.id);
        record.status = SubscriptionStatus::Active;
        record.current_period_end = Some(now - Duration::seconds(1));

        assert_eq!(
            evaluate_access(&user, Some(&record), now),
            AccessDecision::Deny(DenyReason::PeriodElapsed)
        );
    }

    // =========================================================================
    // Pending cancellation still grants access until the period ends
    // =========================================================================
    #[test]
    fn test_cancel_pending_still_allowed() {
        let user = account("leaving@example.com");
        let now = datetime!(2025-06-01 00:00 UTC);
        let mut record = SubscriptionRecord::new(user.id);
        record.status = SubscriptionStatus::Active;
        record.cancel_at_period_end = true;
        record.current_period_end = Some(now + Duration::days(3));

        assert!(evaluate_access(&user, Some(&record), now).is_allowed());
    }
}

#[cfg(test)]
mod webhook_tests {
    use std::sync::Arc;

    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::error::BillingError;
    use crate::models::{SubscriptionRecord, SubscriptionStatus};
    use crate::store::{EventLedger, EventProcessingResult, InMemoryStore, SubscriptionStore};
    use crate::subscriptions::SubscriptionService;
    use crate::testing::{sign_payload, MockProvider};
    use crate::webhooks::{WebhookHandler, WebhookOutcome};

    const SECRET: &str = "whsec_edge";

    fn handler(store: &Arc<InMemoryStore>) -> WebhookHandler {
        let provider = Arc::new(MockProvider::new());
        let subscriptions = Arc::new(SubscriptionService::new(store.clone(), provider));
        WebhookHandler::new(subscriptions, store.clone(), Some(SECRET.to_string()))
    }

    async fn linked(store: &InMemoryStore, subscription_id: &str) -> Uuid {
        let user_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::new(user_id);
        record.stripe_customer_id = Some(format!("cus_{}", subscription_id));
        record.stripe_subscription_id = Some(subscription_id.to_string());
        store.put_subscription(record).await;
        user_id
    }

    fn updated_payload(event_id: &str, subscription_id: &str, created: i64, status: &str) -> String {
        json!({
            "id": event_id,
            "type": "customer.subscription.updated",
            "created": created,
            "data": {"object": {
                "id": subscription_id,
                "status": status,
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000,
                "cancel_at_period_end": false
            }}
        })
        .to_string()
    }

    async fn deliver(handler: &WebhookHandler, payload: &str) -> WebhookOutcome {
        let header = sign_payload(SECRET, payload, OffsetDateTime::now_utc().unix_timestamp());
        let event = handler.verify_event(payload, Some(&header)).unwrap();
        handler.handle_event(&event).await.unwrap()
    }

    // =========================================================================
    // Same "subscription updated" applied twice equals applying it once
    // =========================================================================
    #[tokio::test]
    async fn test_same_update_twice_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let handler = handler(&store);
        let user_id = linked(&store, "sub_twice").await;

        // Distinct event ids so the ledger does not short-circuit the second
        deliver(&handler, &updated_payload("evt_a", "sub_twice", 1_700_000_100, "active")).await;
        let once = store.find_by_user(user_id).await.unwrap().unwrap();

        deliver(&handler, &updated_payload("evt_b", "sub_twice", 1_700_000_100, "active")).await;
        let twice = store.find_by_user(user_id).await.unwrap().unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // Duplicate event id: processed once, acknowledged afterwards
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_event_id_processed_once() {
        let store = Arc::new(InMemoryStore::new());
        let handler = handler(&store);
        linked(&store, "sub_dup").await;

        let payload = updated_payload("evt_dup", "sub_dup", 1_700_000_100, "active");
        assert_eq!(deliver(&handler, &payload).await, WebhookOutcome::Processed);
        assert_eq!(deliver(&handler, &payload).await, WebhookOutcome::Duplicate);
        assert_eq!(deliver(&handler, &payload).await, WebhookOutcome::Duplicate);

        let events = store.list_events(None, 10, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].processing_result, "success");
    }

    // =========================================================================
    // Out-of-order delivery: an older event does not regress the record
    // =========================================================================
    #[tokio::test]
    async fn test_older_event_does_not_regress_status() {
        let store = Arc::new(InMemoryStore::new());
        let handler = handler(&store);
        let user_id = linked(&store, "sub_order").await;

        deliver(&handler, &updated_payload("evt_new", "sub_order", 1_700_000_200, "past_due")).await;
        let outcome =
            deliver(&handler, &updated_payload("evt_old", "sub_order", 1_700_000_100, "active")).await;
        assert_eq!(outcome, WebhookOutcome::Ignored);

        let record = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);

        // The ledger shows the skipped event for what it was
        let ignored = store
            .list_events(Some(EventProcessingResult::Ignored), 10, 0)
            .await
            .unwrap();
        assert_eq!(ignored.len(), 1);
        assert_eq!(ignored[0].stripe_event_id, "evt_old");
    }

    // =========================================================================
    // Invalid signature: rejected before any state is touched
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_signature_never_mutates() {
        let store = Arc::new(InMemoryStore::new());
        let handler = handler(&store);
        let user_id = linked(&store, "sub_forged").await;
        let before = store.find_by_user(user_id).await.unwrap().unwrap();

        let payload = updated_payload("evt_forged", "sub_forged", 1_700_000_100, "active");
        let forged = sign_payload(
            "whsec_attacker",
            &payload,
            OffsetDateTime::now_utc().unix_timestamp(),
        );

        assert!(matches!(
            handler.verify_event(&payload, Some(&forged)),
            Err(BillingError::WebhookSignatureInvalid)
        ));
        assert!(matches!(
            handler.verify_event(&payload, Some("t=1,v1=00")),
            Err(BillingError::WebhookSignatureInvalid)
        ));

        let after = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert!(store.list_events(None, 10, 0).await.unwrap().is_empty());
    }

    // =========================================================================
    // Deleted event after a pending cancellation ends access
    // =========================================================================
    #[tokio::test]
    async fn test_deletion_after_cancel_request() {
        let store = Arc::new(InMemoryStore::new());
        let handler = handler(&store);
        let user_id = linked(&store, "sub_end").await;

        deliver(&handler, &updated_payload("evt_u", "sub_end", 1_700_000_100, "active")).await;
        store.mark_cancel_requested(user_id).await.unwrap();

        let deleted = json!({
            "id": "evt_d",
            "type": "customer.subscription.deleted",
            "created": 1_702_592_000,
            "data": {"object": {"id": "sub_end", "status": "canceled"}}
        })
        .to_string();
        deliver(&handler, &deleted).await;

        let record = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert!(!record.cancel_at_period_end);
        assert!(!record.is_active(OffsetDateTime::now_utc()));
    }
}

#[cfg(test)]
mod cancellation_tests {
    use std::sync::Arc;

    use time::macros::datetime;
    use uuid::Uuid;

    use crate::error::BillingError;
    use crate::models::{SubscriptionRecord, SubscriptionStatus};
    use crate::provider::SubscriptionSnapshot;
    use crate::store::{InMemoryStore, SubscriptionStore};
    use crate::subscriptions::SubscriptionService;
    use crate::testing::MockProvider;

    // =========================================================================
    // Cancel sets the flag and leaves status untouched
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_keeps_status_until_webhook() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let service = SubscriptionService::new(store.clone(), provider.clone());

        let end = datetime!(2031-01-01 00:00 UTC);
        let user_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::new(user_id);
        record.status = SubscriptionStatus::Trialing;
        record.stripe_subscription_id = Some("sub_trial".to_string());
        record.current_period_end = Some(end);
        store.put_subscription(record).await;

        provider
            .put_subscription(SubscriptionSnapshot {
                id: "sub_trial".to_string(),
                customer_id: None,
                status: SubscriptionStatus::Trialing,
                current_period_start: None,
                current_period_end: Some(end),
                cancel_at_period_end: false,
                trial_end: Some(end),
                ended_at: None,
                user_id: None,
            })
            .await;

        let record = service.cancel(user_id).await.unwrap();
        assert!(record.cancel_at_period_end);
        assert_eq!(record.status, SubscriptionStatus::Trialing);
        assert_eq!(record.current_period_end, Some(end));
        assert_eq!(provider.cancel_calls().await, vec!["sub_trial".to_string()]);
    }

    // =========================================================================
    // Cancel for a user who never subscribed
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_without_record_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let service = SubscriptionService::new(store.clone(), provider.clone());

        let err = service.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(provider.cancel_calls().await.is_empty());
        assert_eq!(store.subscription_count().await, 0);
    }
}
