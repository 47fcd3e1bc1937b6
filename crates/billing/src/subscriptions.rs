//! Subscription management
//!
//! Everything that writes provider state into the local record funnels
//! through [`SubscriptionService::apply`], so webhooks, operator syncs and
//! scheduled reconciliation share the same ordering rules.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{ApplyOutcome, SubscriptionRecord, SubscriptionStatus, SubscriptionUpdate};
use crate::provider::{PaymentProvider, SubscriptionSnapshot};
use crate::store::SubscriptionStore;

/// Retries after the first attempt when fetching a subscription
const RETRIEVE_RETRIES: usize = 2;

/// Provider references used to find the owning user of an inbound object
#[derive(Debug, Clone, Default)]
pub struct OwnerLookup<'a> {
    pub subscription_id: Option<&'a str>,
    pub customer_id: Option<&'a str>,
    /// `user_id` the service wrote into provider metadata
    pub metadata_user_id: Option<Uuid>,
}

/// Status payload with derived helpers
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    #[serde(flatten)]
    pub record: SubscriptionRecord,
    pub is_active: bool,
    pub is_in_trial: bool,
    pub days_until_renewal: Option<i64>,
}

impl SubscriptionSummary {
    pub fn new(record: SubscriptionRecord, now: OffsetDateTime) -> Self {
        Self {
            is_active: record.is_active(now),
            is_in_trial: record.is_in_trial(now),
            days_until_renewal: record.days_until_renewal(now),
            record,
        }
    }
}

/// Before/after of an operator-triggered sync
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub user_id: Uuid,
    pub before: SubscriptionRecord,
    pub after: SubscriptionRecord,
    pub outcome: ApplyOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Fetch a subscription, retrying transient provider failures with backoff
pub(crate) async fn retrieve_with_retry(
    provider: &dyn PaymentProvider,
    subscription_id: &str,
) -> BillingResult<SubscriptionSnapshot> {
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(50)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(RETRIEVE_RETRIES);

    Retry::spawn(strategy, move || async move {
        provider
            .retrieve_subscription(subscription_id)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Subscription retrieval failed"
                );
            })
    })
    .await
}

pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn PaymentProvider>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn PaymentProvider> {
        &self.provider
    }

    /// Find the user a provider object belongs to.
    ///
    /// Subscription reference first, then customer reference, then the
    /// `user_id` metadata (only if that account exists).
    pub async fn resolve_owner(&self, lookup: &OwnerLookup<'_>) -> BillingResult<Option<Uuid>> {
        if let Some(subscription_id) = lookup.subscription_id {
            if let Some(record) = self.store.find_by_subscription_id(subscription_id).await? {
                return Ok(Some(record.user_id));
            }
        }

        if let Some(customer_id) = lookup.customer_id {
            if let Some(record) = self.store.find_by_customer_id(customer_id).await? {
                return Ok(Some(record.user_id));
            }
        }

        if let Some(user_id) = lookup.metadata_user_id {
            if self.store.find_account(user_id).await?.is_some() {
                return Ok(Some(user_id));
            }
            tracing::warn!(
                user_id = %user_id,
                "Provider metadata references an unknown account"
            );
        }

        Ok(None)
    }

    /// Apply a provider update to the user's record (creating it if needed)
    pub async fn apply(
        &self,
        user_id: Uuid,
        update: &SubscriptionUpdate,
    ) -> BillingResult<(SubscriptionRecord, ApplyOutcome)> {
        let (record, outcome) = self.store.apply_update(user_id, update).await?;

        match outcome {
            ApplyOutcome::Applied => tracing::info!(
                user_id = %user_id,
                subscription_id = ?record.stripe_subscription_id,
                status = %record.status,
                period_end = ?record.current_period_end,
                cancel_at_period_end = record.cancel_at_period_end,
                "Subscription record updated"
            ),
            ApplyOutcome::Unchanged => tracing::debug!(
                user_id = %user_id,
                "Subscription update already reflected"
            ),
            ApplyOutcome::Stale => tracing::info!(
                user_id = %user_id,
                observed_at = %update.observed_at,
                last_event_at = ?record.last_event_at,
                "Ignoring stale subscription update"
            ),
        }

        Ok((record, outcome))
    }

    /// The user's record, created as `incomplete` if missing
    pub async fn summary(&self, user_id: Uuid) -> BillingResult<SubscriptionSummary> {
        let record = self.store.get_or_create(user_id).await?;
        Ok(SubscriptionSummary::new(record, OffsetDateTime::now_utc()))
    }

    /// Request cancellation at period end.
    ///
    /// Only `cancel_at_period_end` changes locally; the status follows once
    /// the provider reports the subscription deleted.
    pub async fn cancel(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record = self
            .store
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("No subscription found".to_string()))?;

        let subscription_id = record.stripe_subscription_id.as_deref().ok_or_else(|| {
            BillingError::InvalidInput("Subscription has no provider reference".to_string())
        })?;

        if record.cancel_at_period_end {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                "Cancellation already requested"
            );
            return Ok(record);
        }

        self.provider.cancel_at_period_end(subscription_id).await?;
        let updated = self.store.mark_cancel_requested(user_id).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            period_end = ?updated.current_period_end,
            "Subscription cancellation requested"
        );

        Ok(updated)
    }

    /// Re-sync one user's record from the provider
    pub async fn sync_user(&self, user_id: Uuid) -> BillingResult<SyncReport> {
        let before = self
            .store
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No subscription for user {}", user_id)))?;

        let subscription_id = before.stripe_subscription_id.clone().ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "Subscription for user {} has no provider reference",
                user_id
            ))
        })?;

        let observed_at = snapshot_observed_at();
        let snapshot = retrieve_with_retry(self.provider.as_ref(), &subscription_id).await?;
        let update = snapshot_update(&snapshot, observed_at);
        let (after, outcome) = self.apply(user_id, &update).await?;

        Ok(SyncReport {
            user_id,
            before,
            after,
            outcome,
        })
    }

    /// Re-sync the subscription of the account with this email
    pub async fn sync_for_email(&self, email: &str) -> BillingResult<SyncReport> {
        let account = self
            .store
            .find_account_by_email(email)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No account with email {}", email)))?;
        self.sync_user(account.id).await
    }

    /// Re-sync records still marked active whose period has already ended
    pub async fn reconcile_elapsed(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<ReconcileReport> {
        let records = self.store.list_elapsed_active(now, limit).await?;
        let mut report = ReconcileReport {
            checked: records.len(),
            ..Default::default()
        };

        for record in records {
            match self.sync_user(record.user_id).await {
                Ok(sync) if sync.outcome == ApplyOutcome::Applied => report.updated += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        user_id = %record.user_id,
                        subscription_id = ?record.stripe_subscription_id,
                        error = %e,
                        "Failed to reconcile subscription"
                    );
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            updated = report.updated,
            failed = report.failed,
            "Subscription reconciliation finished"
        );

        Ok(report)
    }
}

/// Stamp for a provider snapshot.
///
/// Taken before the fetch and truncated to whole seconds, the resolution of
/// event `created` times, so an event from the same second still applies.
pub(crate) fn snapshot_observed_at() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// Update for a provider snapshot; ended subscriptions are terminal
pub(crate) fn snapshot_update(
    snapshot: &SubscriptionSnapshot,
    observed_at: OffsetDateTime,
) -> SubscriptionUpdate {
    let mut update = snapshot.to_update(observed_at);
    if snapshot.status == SubscriptionStatus::Canceled {
        update.terminal = true;
        update.cancel_at_period_end = Some(false);
        if let Some(ended_at) = snapshot.ended_at {
            update.current_period_end = Some(ended_at);
        }
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::testing::{account, MockProvider};
    use time::macros::datetime;

    fn active_snapshot(id: &str, end: OffsetDateTime) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: id.to_string(),
            customer_id: Some("cus_1".to_string()),
            status: SubscriptionStatus::Active,
            current_period_start: Some(end - time::Duration::days(30)),
            current_period_end: Some(end),
            cancel_at_period_end: false,
            trial_end: None,
            ended_at: None,
            user_id: None,
        }
    }

    async fn setup() -> (Arc<InMemoryStore>, Arc<MockProvider>, SubscriptionService) {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let service = SubscriptionService::new(store.clone(), provider.clone());
        (store, provider, service)
    }

    #[test]
    fn test_snapshot_stamp_has_whole_seconds() {
        let before = OffsetDateTime::now_utc();
        let stamp = snapshot_observed_at();
        assert_eq!(stamp.nanosecond(), 0);
        assert!(stamp <= before + time::Duration::seconds(1));
        assert!(stamp.unix_timestamp() >= before.unix_timestamp());
    }

    #[tokio::test]
    async fn test_sync_does_not_shadow_same_second_event() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let service = SubscriptionService::new(store.clone(), provider.clone());

        let user_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::new(user_id);
        record.stripe_subscription_id = Some("sub_sync".to_string());
        store.put_subscription(record).await;

        let end = OffsetDateTime::now_utc() + time::Duration::days(30);
        let mut snapshot = active_snapshot("sub_sync", end);
        snapshot.status = SubscriptionStatus::Incomplete;
        provider.put_subscription(snapshot).await;

        let report = service.sync_user(user_id).await.unwrap();
        let synced_at = report.after.last_event_at.unwrap();
        assert_eq!(synced_at.nanosecond(), 0);

        let mut update = SubscriptionUpdate::new(synced_at);
        update.status = Some(SubscriptionStatus::Active);
        let (record, outcome) = service.apply(user_id, &update).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(record.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_resolve_owner_order() {
        let (store, _, service) = setup().await;
        let by_sub = Uuid::new_v4();
        let by_customer = Uuid::new_v4();

        let mut record = SubscriptionRecord::new(by_sub);
        record.stripe_subscription_id = Some("sub_a".to_string());
        store.put_subscription(record).await;
        let mut record = SubscriptionRecord::new(by_customer);
        record.stripe_customer_id = Some("cus_b".to_string());
        store.put_subscription(record).await;

        let lookup = OwnerLookup {
            subscription_id: Some("sub_a"),
            customer_id: Some("cus_b"),
            metadata_user_id: None,
        };
        assert_eq!(service.resolve_owner(&lookup).await.unwrap(), Some(by_sub));

        let lookup = OwnerLookup {
            subscription_id: Some("sub_unknown"),
            customer_id: Some("cus_b"),
            metadata_user_id: None,
        };
        assert_eq!(service.resolve_owner(&lookup).await.unwrap(), Some(by_customer));
    }

    #[tokio::test]
    async fn test_resolve_owner_metadata_requires_account() {
        let (store, _, service) = setup().await;
        let known = account("known@example.com");
        store.insert_account(known.clone()).await;

        let lookup = OwnerLookup {
            metadata_user_id: Some(known.id),
            ..Default::default()
        };
        assert_eq!(service.resolve_owner(&lookup).await.unwrap(), Some(known.id));

        let lookup = OwnerLookup {
            metadata_user_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert_eq!(service.resolve_owner(&lookup).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_summary_creates_record_lazily() {
        let (store, _, service) = setup().await;
        let user_id = Uuid::new_v4();

        let summary = service.summary(user_id).await.unwrap();
        assert_eq!(summary.record.status, SubscriptionStatus::Incomplete);
        assert!(!summary.is_active);
        assert_eq!(summary.days_until_renewal, None);
        assert_eq!(store.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_sets_flag_and_keeps_status() {
        let (store, provider, service) = setup().await;
        let user_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::new(user_id);
        record.status = SubscriptionStatus::Active;
        record.stripe_subscription_id = Some("sub_c".to_string());
        store.put_subscription(record).await;
        provider
            .put_subscription(active_snapshot("sub_c", datetime!(2030-01-01 00:00 UTC)))
            .await;

        let updated = service.cancel(user_id).await.unwrap();
        assert!(updated.cancel_at_period_end);
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(provider.cancel_calls().await, vec!["sub_c".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_without_reference() {
        let (store, provider, service) = setup().await;
        let user_id = Uuid::new_v4();

        assert!(matches!(
            service.cancel(user_id).await,
            Err(BillingError::NotFound(_))
        ));

        store.put_subscription(SubscriptionRecord::new(user_id)).await;
        assert!(matches!(
            service.cancel(user_id).await,
            Err(BillingError::InvalidInput(_))
        ));
        assert!(provider.cancel_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_provider_failure_leaves_record() {
        let (store, provider, service) = setup().await;
        let user_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::new(user_id);
        record.status = SubscriptionStatus::Active;
        record.stripe_subscription_id = Some("sub_c".to_string());
        store.put_subscription(record).await;

        provider.fail_next(1).await;
        assert!(service.cancel(user_id).await.is_err());

        let stored = store.find_by_user(user_id).await.unwrap().unwrap();
        assert!(!stored.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_sync_for_email_applies_provider_state() {
        let (store, provider, service) = setup().await;
        let user = account("sync@example.com");
        store.insert_account(user.clone()).await;

        let mut record = SubscriptionRecord::new(user.id);
        record.stripe_subscription_id = Some("sub_s".to_string());
        store.put_subscription(record).await;

        let end = datetime!(2030-01-01 00:00 UTC);
        provider.put_subscription(active_snapshot("sub_s", end)).await;

        let report = service.sync_for_email("SYNC@example.com").await.unwrap();
        assert_eq!(report.before.current_period_end, None);
        assert_eq!(report.after.current_period_end, Some(end));
        assert_eq!(report.after.status, SubscriptionStatus::Active);
        assert_eq!(report.outcome, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_sync_retries_transient_failure() {
        let (store, provider, service) = setup().await;
        let user_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::new(user_id);
        record.stripe_subscription_id = Some("sub_r".to_string());
        store.put_subscription(record).await;

        provider
            .put_subscription(active_snapshot("sub_r", datetime!(2030-01-01 00:00 UTC)))
            .await;
        provider.fail_next(1).await;

        let report = service.sync_user(user_id).await.unwrap();
        assert_eq!(report.after.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_reconcile_elapsed_picks_up_cancellation() {
        let (store, provider, service) = setup().await;
        let now = datetime!(2025-05-01 00:00 UTC);
        let user_id = Uuid::new_v4();

        let mut record = SubscriptionRecord::new(user_id);
        record.status = SubscriptionStatus::Active;
        record.stripe_subscription_id = Some("sub_e".to_string());
        record.current_period_start = Some(now - time::Duration::days(31));
        record.current_period_end = Some(now - time::Duration::days(1));
        store.put_subscription(record).await;

        let mut snapshot = active_snapshot("sub_e", now - time::Duration::days(1));
        snapshot.status = SubscriptionStatus::Canceled;
        snapshot.ended_at = Some(now - time::Duration::days(1));
        provider.put_subscription(snapshot).await;

        let report = service.reconcile_elapsed(now, 50).await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                checked: 1,
                updated: 1,
                failed: 0
            }
        );

        let stored = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
        assert!(!stored.cancel_at_period_end);
    }
}
