//! In-memory store for tests and local development

use std::collections::HashMap;

use async_trait::async_trait;
use billgate_shared::Account;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    EventLedger, EventProcessingResult, SubscriptionStore, WebhookEventRecord,
    PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{ApplyOutcome, SubscriptionRecord, SubscriptionUpdate};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    events: HashMap<String, WebhookEventRecord>,
}

impl MemoryState {
    /// Provider references are unique across records, as in the database
    fn check_unique(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let clash = self.subscriptions.values().any(|other| {
            other.user_id != record.user_id
                && ((record.stripe_customer_id.is_some()
                    && other.stripe_customer_id == record.stripe_customer_id)
                    || (record.stripe_subscription_id.is_some()
                        && other.stripe_subscription_id == record.stripe_subscription_id))
        });
        if clash {
            return Err(BillingError::Database(format!(
                "duplicate provider reference for user {}",
                record.user_id
            )));
        }
        Ok(())
    }

    fn entry(&mut self, user_id: Uuid) -> &mut SubscriptionRecord {
        self.subscriptions
            .entry(user_id)
            .or_insert_with(|| SubscriptionRecord::new(user_id))
    }
}

/// Mutex-guarded maps; every operation is atomic with respect to the others
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: Account) {
        self.state.lock().await.accounts.insert(account.id, account);
    }

    /// Overwrite a record directly, bypassing the update rules
    pub async fn put_subscription(&self, record: SubscriptionRecord) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(record.user_id, record);
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn find_account(&self, user_id: Uuid) -> BillingResult<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&user_id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        Ok(self
            .state
            .lock()
            .await
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn find_by_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned())
    }

    async fn find_by_customer_id(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.stripe_customer_id.as_deref() == Some(stripe_customer_id))
            .cloned())
    }

    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        Ok(self.state.lock().await.entry(user_id).clone())
    }

    async fn link_customer(
        &self,
        user_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let mut state = self.state.lock().await;
        let mut record = state.entry(user_id).clone();
        if record.stripe_customer_id.as_deref() == Some(stripe_customer_id) {
            return Ok(record);
        }
        record.stripe_customer_id = Some(stripe_customer_id.to_string());
        record.updated_at = OffsetDateTime::now_utc();
        state.check_unique(&record)?;
        state.subscriptions.insert(user_id, record.clone());
        Ok(record)
    }

    async fn apply_update(
        &self,
        user_id: Uuid,
        update: &SubscriptionUpdate,
    ) -> BillingResult<(SubscriptionRecord, ApplyOutcome)> {
        let mut state = self.state.lock().await;
        let mut record = state.entry(user_id).clone();
        let outcome = record.apply(update);
        if outcome == ApplyOutcome::Applied {
            record.updated_at = OffsetDateTime::now_utc();
            state.check_unique(&record)?;
            state.subscriptions.insert(user_id, record.clone());
        }
        Ok((record, outcome))
    }

    async fn mark_cancel_requested(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let mut state = self.state.lock().await;
        let record = state
            .subscriptions
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))?;
        if !record.cancel_at_period_end {
            record.cancel_at_period_end = true;
            record.updated_at = OffsetDateTime::now_utc();
        }
        Ok(record.clone())
    }

    async fn list_elapsed_active(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<SubscriptionRecord> = state
            .subscriptions
            .values()
            .filter(|s| {
                s.status.grants_access()
                    && s.stripe_subscription_id.is_some()
                    && s.current_period_end.map(|end| end <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        records.sort_by_key(|s| s.current_period_end);
        records.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(records)
    }
}

#[async_trait]
impl EventLedger for InMemoryStore {
    async fn claim_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = state.events.get_mut(stripe_event_id) {
            let stuck = existing.processing_result == EventProcessingResult::Processing.as_str()
                && existing
                    .processing_started_at
                    .map(|started| started < now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES))
                    .unwrap_or(false);
            let failed = existing.processing_result == EventProcessingResult::Error.as_str();
            if !stuck && !failed {
                return Ok(false);
            }
            if stuck {
                existing.error_message = Some(format!("Recovered from stuck state at {}", now));
            }
            existing.processing_result = EventProcessingResult::Processing.as_str().to_string();
            existing.processing_started_at = Some(now);
            return Ok(true);
        }

        state.events.insert(
            stripe_event_id.to_string(),
            WebhookEventRecord {
                id: Uuid::new_v4(),
                stripe_event_id: stripe_event_id.to_string(),
                event_type: event_type.to_string(),
                event_timestamp,
                processing_result: EventProcessingResult::Processing.as_str().to_string(),
                processing_started_at: Some(now),
                error_message: None,
                created_at: now,
            },
        );
        Ok(true)
    }

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        result: EventProcessingResult,
        error_message: Option<String>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .events
            .get_mut(stripe_event_id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", stripe_event_id)))?;
        record.processing_result = result.as_str().to_string();
        record.error_message = error_message;
        Ok(())
    }

    async fn list_events(
        &self,
        result_filter: Option<EventProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let state = self.state.lock().await;
        let mut events: Vec<WebhookEventRecord> = state
            .events
            .values()
            .filter(|e| {
                result_filter
                    .map(|r| e.processing_result == r.as_str())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }
}
