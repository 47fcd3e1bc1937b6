//! Access guard
//!
//! Decides whether an account may reach a protected resource. The decision is
//! a pure function of the account, its subscription record (if any) and the
//! current time, so callers can evaluate it anywhere without side effects.

use billgate_shared::Account;
use serde::Serialize;
use time::OffsetDateTime;

use crate::models::{SubscriptionRecord, SubscriptionStatus};

/// Why access was granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    ElevatedRole,
    ActiveSubscription,
}

/// Why access was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "status")]
pub enum DenyReason {
    NoSubscription,
    Inactive(SubscriptionStatus),
    NoPeriod,
    PeriodElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow(AllowReason),
    Deny(DenyReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow(_))
    }
}

/// Evaluate the access guard for one request
pub fn evaluate_access(
    account: &Account,
    subscription: Option<&SubscriptionRecord>,
    now: OffsetDateTime,
) -> AccessDecision {
    if account.is_elevated() {
        return AccessDecision::Allow(AllowReason::ElevatedRole);
    }

    let Some(subscription) = subscription else {
        return AccessDecision::Deny(DenyReason::NoSubscription);
    };

    if !subscription.status.grants_access() {
        return AccessDecision::Deny(DenyReason::Inactive(subscription.status));
    }

    match subscription.current_period_end {
        None => AccessDecision::Deny(DenyReason::NoPeriod),
        Some(end) if now >= end => AccessDecision::Deny(DenyReason::PeriodElapsed),
        Some(_) => AccessDecision::Allow(AllowReason::ActiveSubscription),
    }
}
