//! Persistence for subscription records and the webhook event ledger
//!
//! Two backends implement the same traits: Postgres for deployments and an
//! in-memory store for tests and local development.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use billgate_shared::Account;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{ApplyOutcome, SubscriptionRecord, SubscriptionUpdate};

/// Events stuck in `processing` longer than this may be claimed again
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_account(&self, user_id: Uuid) -> BillingResult<Option<Account>>;

    async fn find_account_by_email(&self, email: &str) -> BillingResult<Option<Account>>;

    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_by_customer_id(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Return the user's record, creating an `incomplete` one if missing
    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord>;

    /// Store the provider customer reference, creating the record if missing
    async fn link_customer(
        &self,
        user_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<SubscriptionRecord>;

    /// Atomically load (or create) the user's record and apply a provider update
    async fn apply_update(
        &self,
        user_id: Uuid,
        update: &SubscriptionUpdate,
    ) -> BillingResult<(SubscriptionRecord, ApplyOutcome)>;

    /// Record an accepted cancellation request; never touches `status`
    async fn mark_cancel_requested(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord>;

    /// Records still marked active/trialing whose period ended before `now`
    async fn list_elapsed_active(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>>;
}

/// Processing state of a received webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventProcessingResult {
    Processing,
    Success,
    Ignored,
    Error,
}

impl EventProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventProcessingResult::Processing => "processing",
            EventProcessingResult::Success => "success",
            EventProcessingResult::Ignored => "ignored",
            EventProcessingResult::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(EventProcessingResult::Processing),
            "success" => Some(EventProcessingResult::Success),
            "ignored" => Some(EventProcessingResult::Ignored),
            "error" => Some(EventProcessingResult::Error),
            _ => None,
        }
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Claim exclusive processing rights for an event id.
    ///
    /// Returns `false` when the event was already claimed (duplicate delivery),
    /// unless its last attempt failed or it has been stuck in `processing`
    /// past the timeout.
    async fn claim_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        result: EventProcessingResult,
        error_message: Option<String>,
    ) -> BillingResult<()>;

    async fn list_events(
        &self,
        result_filter: Option<EventProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;
}
