//! Webhook event payloads
//!
//! Stripe payloads are decoded into narrow serde types instead of the
//! async-stripe `Event` so newer API shapes (flexible billing periods on
//! subscription items, invoice `parent.subscription_details`) still parse.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{SubscriptionStatus, SubscriptionUpdate};
use crate::provider::USER_ID_METADATA_KEY;

/// Event kinds the synchronizer acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    /// `invoice.paid` and `invoice.payment_succeeded`
    InvoicePaid,
    InvoicePaymentFailed,
    CheckoutSessionCompleted,
    Unhandled,
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.paid" | "invoice.payment_succeeded" => EventKind::InvoicePaid,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            _ => EventKind::Unhandled,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// Event creation time; falls back to now for out-of-range values
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created).unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    /// Decode `data.object` into the shape expected for this event
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayloadInvalid(format!(
                "{} object did not match expected shape: {}",
                self.event_type, e
            ))
        })
    }
}

/// A provider reference sent either as a bare id or an expanded object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    pub fn id(&self) -> &str {
        match self {
            ExpandableId::Id(id) => id,
            ExpandableId::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Period {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItemObject {
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub period: Option<Period>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: Option<ExpandableId>,
    pub status: Option<String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: Option<bool>,
    pub trial_end: Option<i64>,
    pub ended_at: Option<i64>,
    pub metadata: Option<HashMap<String, String>>,
    pub items: Option<List<SubscriptionItemObject>>,
}

impl SubscriptionObject {
    /// Billing period bounds as unix seconds.
    ///
    /// Top-level fields first (classic billing), then the first item's
    /// `current_period_*` (flexible billing), then the item's `period`.
    pub fn period(&self) -> (Option<i64>, Option<i64>) {
        let mut start = present(self.current_period_start);
        let mut end = present(self.current_period_end);

        if let Some(item) = self.items.as_ref().and_then(|items| items.data.first()) {
            start = start.or(present(item.current_period_start));
            end = end.or(present(item.current_period_end));

            let period = item.period.clone().unwrap_or_default();
            start = start.or(present(period.start));
            end = end.or(present(period.end));
        }

        (start, end)
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ExpandableId::id)
    }

    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_provider(self.status.as_deref().unwrap_or("incomplete"))
    }

    pub fn user_id(&self) -> Option<Uuid> {
        metadata_user_id(self.metadata.as_ref())
    }

    /// Record update carrying everything this payload states
    pub fn to_update(&self, observed_at: OffsetDateTime) -> SubscriptionUpdate {
        let (start, end) = self.period();
        SubscriptionUpdate {
            stripe_customer_id: self.customer_id().map(str::to_string),
            stripe_subscription_id: Some(self.id.clone()),
            status: Some(self.status()),
            current_period_start: start.and_then(to_datetime),
            current_period_end: end.and_then(to_datetime),
            cancel_at_period_end: Some(self.cancel_at_period_end.unwrap_or(false)),
            trial_end: present(self.trial_end).and_then(to_datetime),
            ..SubscriptionUpdate::new(observed_at)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLineObject {
    pub period: Option<Period>,
    pub subscription: Option<ExpandableId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    pub subscription: Option<ExpandableId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: Option<String>,
    pub customer: Option<ExpandableId>,
    pub subscription: Option<ExpandableId>,
    pub parent: Option<InvoiceParent>,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
    pub lines: Option<List<InvoiceLineObject>>,
}

impl InvoiceObject {
    /// Subscription reference; newer API versions move it under `parent`
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|p| p.subscription_details.as_ref())
                    .and_then(|d| d.subscription.as_ref())
            })
            .or_else(|| {
                self.lines
                    .as_ref()
                    .and_then(|l| l.data.first())
                    .and_then(|line| line.subscription.as_ref())
            })
            .map(ExpandableId::id)
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ExpandableId::id)
    }

    /// Service period billed by this invoice: first line's period, then the
    /// invoice-level period
    pub fn period(&self) -> (Option<i64>, Option<i64>) {
        let line_period = self
            .lines
            .as_ref()
            .and_then(|l| l.data.first())
            .and_then(|line| line.period.clone())
            .unwrap_or_default();

        (
            present(line_period.start).or(present(self.period_start)),
            present(line_period.end).or(present(self.period_end)),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub customer: Option<ExpandableId>,
    pub subscription: Option<ExpandableId>,
    pub client_reference_id: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

impl CheckoutSessionObject {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ExpandableId::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(ExpandableId::id)
    }

    pub fn user_id(&self) -> Option<Uuid> {
        metadata_user_id(self.metadata.as_ref()).or_else(|| {
            self.client_reference_id
                .as_deref()
                .and_then(|id| Uuid::parse_str(id).ok())
        })
    }
}

fn metadata_user_id(metadata: Option<&HashMap<String, String>>) -> Option<Uuid> {
    metadata
        .and_then(|m| m.get(USER_ID_METADATA_KEY))
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Zero timestamps are treated as absent
fn present(value: Option<i64>) -> Option<i64> {
    value.filter(|v| *v > 0)
}

pub fn to_datetime(unix: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix).ok()
}
