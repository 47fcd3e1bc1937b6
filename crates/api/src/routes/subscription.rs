//! Subscription routes: status, required page, checkout, landing, cancel
//!
//! None of these write `status`; it only changes through webhooks and
//! operator syncs.

use axum::{
    extract::{Extension, Query, State},
    response::Redirect,
    Json,
};
use billgate_billing::{
    BillingError, CheckoutInfo, CheckoutState, SubscriptionSummary,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct SubscriptionRequiredResponse {
    #[serde(flatten)]
    pub subscription: SubscriptionSummary,
    /// Whether checkout has ever produced a provider subscription
    pub has_subscription: bool,
    pub checkout_url: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct SuccessQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub state: CheckoutState,
    pub message: &'static str,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub message: &'static str,
    pub subscription: SubscriptionSummary,
}

fn require_billing(state: &AppState) -> ApiResult<&billgate_billing::BillingService> {
    state
        .billing_service()
        .map(|billing| billing.as_ref())
        .ok_or_else(|| ApiError::BillingNotConfigured("Stripe billing is disabled".to_string()))
}

/// GET /subscription
pub async fn get_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let record = state.store.get_or_create(auth_user.account.id).await?;
    Ok(Json(SubscriptionSummary::new(record, OffsetDateTime::now_utc())))
}

/// GET /subscription/required
pub async fn get_required(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionRequiredResponse>> {
    let record = state.store.get_or_create(auth_user.account.id).await?;
    let has_subscription = record.stripe_subscription_id.is_some();

    Ok(Json(SubscriptionRequiredResponse {
        subscription: SubscriptionSummary::new(record, OffsetDateTime::now_utc()),
        has_subscription,
        checkout_url: "/subscription/checkout",
    }))
}

/// GET /subscription/checkout
pub async fn get_checkout_info(State(state): State<AppState>) -> Json<CheckoutInfo> {
    let info = state
        .billing_service()
        .map(|billing| billing.checkout.info())
        .unwrap_or_else(CheckoutInfo::not_configured);

    if let Some(error) = &info.error {
        tracing::warn!(error = %error, "Checkout is not available");
    }

    Json(info)
}

/// POST /subscription/checkout
///
/// Redirects (303) to the provider-hosted payment page.
pub async fn start_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Redirect> {
    let billing = require_billing(&state)?;
    let start = billing.checkout.start_checkout(&auth_user.account).await?;
    Ok(Redirect::to(&start.url))
}

/// GET /subscription/success?session_id=...
pub async fn get_success(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<SuccessQuery>,
) -> ApiResult<Json<SuccessResponse>> {
    let Some(billing) = state.billing_service() else {
        return Ok(Json(SuccessResponse {
            state: CheckoutState::Pending,
            message: "Your subscription is being processed. Please check back in a few moments.",
            session_id: query.session_id,
        }));
    };

    let confirmation = match billing
        .checkout
        .confirm_success(auth_user.account.id, query.session_id.as_deref())
        .await
    {
        Ok(confirmation) => confirmation,
        Err(BillingError::StripeApi(e)) => {
            // The webhook still activates the subscription
            tracing::error!(
                user_id = %auth_user.account.id,
                error = %e,
                "Stripe error while confirming checkout"
            );
            return Ok(Json(SuccessResponse {
                state: CheckoutState::Pending,
                message: "Your subscription is being processed. Please check back in a few moments.",
                session_id: query.session_id,
            }));
        }
        Err(e) => return Err(e.into()),
    };

    let message = match (confirmation.state, &confirmation.session_id) {
        (CheckoutState::Activating, _) => {
            "Checkout completed successfully! Your subscription is being activated."
        }
        (CheckoutState::Pending, Some(_)) => {
            "Checkout session created. Your subscription will be activated once payment is confirmed."
        }
        (CheckoutState::Pending, None) => {
            "No checkout session found. Your subscription may still be processing."
        }
    };

    Ok(Json(SuccessResponse {
        state: confirmation.state,
        message,
        session_id: confirmation.session_id,
    }))
}

/// POST /subscription/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CancelResponse>> {
    let billing = require_billing(&state)?;
    let record = billing.subscriptions.cancel(auth_user.account.id).await?;

    Ok(Json(CancelResponse {
        message: "Your subscription will be canceled at the end of the current billing period.",
        subscription: SubscriptionSummary::new(record, OffsetDateTime::now_utc()),
    }))
}
