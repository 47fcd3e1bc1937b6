//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, claims the event in the ledger
//! so each event id is processed once, and applies subscription lifecycle
//! changes to the local record.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{
    to_datetime, CheckoutSessionObject, EventKind, InvoiceObject, SubscriptionObject,
    WebhookEvent,
};
use crate::models::{ApplyOutcome, SubscriptionStatus, SubscriptionUpdate};
use crate::store::{EventLedger, EventProcessingResult};
use crate::subscriptions::{
    retrieve_with_retry, snapshot_observed_at, snapshot_update, OwnerLookup, SubscriptionService,
};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (and clock skew) of a signed payload
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`).
///
/// The expected signature is HMAC-SHA256 over `"<t>.<payload>"`; any `v1`
/// entry may match.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = Some(value),
                "v1" => signatures.push(value),
                _ => {}
            }
        }
    }

    let timestamp_raw = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    let timestamp: i64 = timestamp_raw.parse().map_err(|_| {
        tracing::warn!("Malformed timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp_raw.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// What happened to a verified event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Unhandled kind, or nothing local to update
    Ignored,
    /// Already claimed by an earlier delivery
    Duplicate,
}

pub struct WebhookHandler {
    subscriptions: Arc<SubscriptionService>,
    ledger: Arc<dyn EventLedger>,
    webhook_secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        ledger: Arc<dyn EventLedger>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            webhook_secret,
        }
    }

    /// Verify the signature and decode the event envelope
    pub fn verify_event(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> BillingResult<WebhookEvent> {
        let secret = self.webhook_secret.as_deref().ok_or_else(|| {
            tracing::warn!("Stripe webhook secret not configured");
            BillingError::NotConfigured("STRIPE_WEBHOOK_SECRET not set".to_string())
        })?;

        let signature = signature.ok_or_else(|| {
            tracing::warn!("Missing Stripe signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        verify_signature(
            payload,
            signature,
            secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let event = WebhookEvent::parse(payload)?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Received Stripe webhook"
        );

        Ok(event)
    }

    /// Process a verified event at most once per event id
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let claimed = self
            .ledger
            .claim_event(&event.id, &event.event_type, event.created_at())
            .await?;

        if !claimed {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let result = self.process(event).await;

        let (processing_result, error_message) = match &result {
            Ok(result) => (*result, None),
            Err(e) => (EventProcessingResult::Error, Some(e.to_string())),
        };

        // Retry once; a missed update leaves the event looking stuck
        if let Err(e) = self
            .ledger
            .finish_event(&event.id, processing_result, error_message.clone())
            .await
        {
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                "First attempt to update webhook event failed, retrying"
            );
            if let Err(retry_err) = self
                .ledger
                .finish_event(&event.id, processing_result, error_message)
                .await
            {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    processing_result = processing_result.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record webhook processing result"
                );
            }
        }

        match result {
            Ok(EventProcessingResult::Success) => Ok(WebhookOutcome::Processed),
            Ok(_) => Ok(WebhookOutcome::Ignored),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Error handling webhook"
                );
                Err(e)
            }
        }
    }

    async fn process(&self, event: &WebhookEvent) -> BillingResult<EventProcessingResult> {
        match event.kind() {
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.handle_subscription_changed(event).await
            }
            EventKind::SubscriptionDeleted => self.handle_subscription_deleted(event).await,
            EventKind::InvoicePaid => self.handle_invoice_paid(event).await,
            EventKind::InvoicePaymentFailed => self.handle_invoice_payment_failed(event).await,
            EventKind::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventKind::Unhandled => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Unhandled Stripe event type"
                );
                Ok(EventProcessingResult::Ignored)
            }
        }
    }

    async fn handle_subscription_changed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<EventProcessingResult> {
        let subscription: SubscriptionObject = event.object()?;

        let Some(user_id) = self
            .subscriptions
            .resolve_owner(&OwnerLookup {
                subscription_id: Some(&subscription.id),
                customer_id: subscription.customer_id(),
                metadata_user_id: subscription.user_id(),
            })
            .await?
        else {
            tracing::warn!(
                subscription_id = %subscription.id,
                customer_id = ?subscription.customer_id(),
                "No local user for subscription"
            );
            return Ok(EventProcessingResult::Ignored);
        };

        let update = subscription.to_update(event.created_at());
        let (_, outcome) = self.subscriptions.apply(user_id, &update).await?;
        if outcome == ApplyOutcome::Stale {
            return Ok(stale_event(event, user_id));
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            status = %subscription.status(),
            event_type = %event.event_type,
            "Subscription synced from webhook"
        );

        Ok(EventProcessingResult::Success)
    }

    async fn handle_subscription_deleted(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<EventProcessingResult> {
        let subscription: SubscriptionObject = event.object()?;

        let Some(user_id) = self
            .subscriptions
            .resolve_owner(&OwnerLookup {
                subscription_id: Some(&subscription.id),
                customer_id: subscription.customer_id(),
                metadata_user_id: None,
            })
            .await?
        else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Subscription deleted for unknown record"
            );
            return Ok(EventProcessingResult::Ignored);
        };

        let observed_at = event.created_at();
        let ended_at = subscription
            .ended_at
            .and_then(to_datetime)
            .unwrap_or(observed_at);

        let update = SubscriptionUpdate {
            stripe_subscription_id: Some(subscription.id.clone()),
            stripe_customer_id: subscription.customer_id().map(str::to_string),
            status: Some(SubscriptionStatus::Canceled),
            current_period_end: Some(ended_at),
            cancel_at_period_end: Some(false),
            terminal: true,
            ..SubscriptionUpdate::new(observed_at)
        };
        let (_, outcome) = self.subscriptions.apply(user_id, &update).await?;
        if outcome == ApplyOutcome::Stale {
            return Ok(stale_event(event, user_id));
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            ended_at = %ended_at,
            "Subscription marked as canceled"
        );

        Ok(EventProcessingResult::Success)
    }

    async fn handle_invoice_paid(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<EventProcessingResult> {
        let invoice: InvoiceObject = event.object()?;

        // One-off invoices carry no subscription
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::debug!(invoice_id = ?invoice.id, "Invoice without subscription");
            return Ok(EventProcessingResult::Ignored);
        };

        let Some(user_id) = self
            .subscriptions
            .resolve_owner(&OwnerLookup {
                subscription_id: Some(subscription_id),
                customer_id: invoice.customer_id(),
                metadata_user_id: None,
            })
            .await?
        else {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Subscription not found for invoice"
            );
            return Ok(EventProcessingResult::Ignored);
        };

        // The provider's subscription is authoritative for the new period
        let observed_at = snapshot_observed_at();
        let update = match retrieve_with_retry(
            self.subscriptions.provider().as_ref(),
            subscription_id,
        )
        .await
        {
            Ok(snapshot) => snapshot_update(&snapshot, observed_at),
            Err(e) => {
                let (start, end) = invoice.period();
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    period_start = ?start,
                    period_end = ?end,
                    "Using invoice period as fallback (subscription retrieval failed)"
                );
                SubscriptionUpdate {
                    stripe_subscription_id: Some(subscription_id.to_string()),
                    current_period_start: start.and_then(to_datetime),
                    current_period_end: end.and_then(to_datetime),
                    ..SubscriptionUpdate::new(event.created_at())
                }
            }
        };

        let (record, _) = self.subscriptions.apply(user_id, &update).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            invoice_id = ?invoice.id,
            period_start = ?record.current_period_start,
            period_end = ?record.current_period_end,
            "Invoice paid, billing period refreshed"
        );

        Ok(EventProcessingResult::Success)
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<EventProcessingResult> {
        let invoice: InvoiceObject = event.object()?;

        let Some(subscription_id) = invoice.subscription_id() else {
            return Ok(EventProcessingResult::Ignored);
        };

        let Some(user_id) = self
            .subscriptions
            .resolve_owner(&OwnerLookup {
                subscription_id: Some(subscription_id),
                customer_id: invoice.customer_id(),
                metadata_user_id: None,
            })
            .await?
        else {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Subscription not found for failed invoice"
            );
            return Ok(EventProcessingResult::Ignored);
        };

        let update = SubscriptionUpdate {
            stripe_subscription_id: Some(subscription_id.to_string()),
            status: Some(SubscriptionStatus::PastDue),
            ..SubscriptionUpdate::new(event.created_at())
        };
        let (_, outcome) = self.subscriptions.apply(user_id, &update).await?;
        if outcome == ApplyOutcome::Stale {
            return Ok(stale_event(event, user_id));
        }

        tracing::warn!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            invoice_id = ?invoice.id,
            "Invoice payment failed, subscription marked past due"
        );

        Ok(EventProcessingResult::Success)
    }

    async fn handle_checkout_completed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<EventProcessingResult> {
        let session: CheckoutSessionObject = event.object()?;

        let Some(subscription_id) = session.subscription_id() else {
            tracing::warn!(
                session_id = %session.id,
                "No subscription in checkout.session.completed event"
            );
            return Ok(EventProcessingResult::Ignored);
        };

        let Some(user_id) = self
            .subscriptions
            .resolve_owner(&OwnerLookup {
                subscription_id: Some(subscription_id),
                customer_id: session.customer_id(),
                metadata_user_id: session.user_id(),
            })
            .await?
        else {
            tracing::warn!(
                session_id = %session.id,
                customer_id = ?session.customer_id(),
                "No local user for completed checkout"
            );
            return Ok(EventProcessingResult::Ignored);
        };

        // Link first so later events for this subscription resolve
        let link = SubscriptionUpdate {
            stripe_customer_id: session.customer_id().map(str::to_string),
            stripe_subscription_id: Some(subscription_id.to_string()),
            ..SubscriptionUpdate::new(event.created_at())
        };
        self.subscriptions.apply(user_id, &link).await?;

        let observed_at = snapshot_observed_at();
        match retrieve_with_retry(self.subscriptions.provider().as_ref(), subscription_id).await {
            Ok(snapshot) => {
                let update = snapshot_update(&snapshot, observed_at);
                self.subscriptions.apply(user_id, &update).await?;
            }
            Err(e) => {
                // subscription.created/updated will carry the state
                tracing::warn!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Could not retrieve subscription after checkout"
                );
            }
        }

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            subscription_id = %subscription_id,
            "Checkout completed, subscription linked"
        );

        Ok(EventProcessingResult::Success)
    }
}

/// An event older than the record's last applied change
fn stale_event(event: &WebhookEvent, user_id: uuid::Uuid) -> EventProcessingResult {
    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        user_id = %user_id,
        "Stale webhook event skipped"
    );
    EventProcessingResult::Ignored
}
