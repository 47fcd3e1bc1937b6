//! Subscription record and the rules for applying provider updates to it

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Subscription status, using the provider's vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// Map a provider status string; anything unrecognised is `incomplete`
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "paused" => SubscriptionStatus::Paused,
            _ => SubscriptionStatus::Incomplete,
        }
    }

    /// Statuses that grant access while the paid period lasts
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subscription row per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// A fresh record for a user who has not completed checkout yet
    pub fn new(user_id: Uuid) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: SubscriptionStatus::Incomplete,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            trial_end: None,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the subscription currently grants access
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.status.grants_access()
            && self
                .current_period_end
                .map(|end| now < end)
                .unwrap_or(false)
    }

    pub fn is_in_trial(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Trialing
            && self.trial_end.map(|end| now < end).unwrap_or(false)
    }

    /// Whole days until the current period ends, floored at zero
    pub fn days_until_renewal(&self, now: OffsetDateTime) -> Option<i64> {
        self.current_period_end
            .map(|end| (end - now).whole_days().max(0))
    }

    pub fn validate(&self) -> BillingResult<()> {
        if let (Some(start), Some(end)) = (self.current_period_start, self.current_period_end) {
            if end <= start {
                return Err(BillingError::InvalidInput(
                    "Current period end must be after current period start".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Apply a provider-sourced update.
    ///
    /// Updates older than `last_event_at` only fill in missing provider
    /// references. A period end that moves backwards is ignored unless the
    /// update is terminal (subscription deleted).
    pub fn apply(&mut self, update: &SubscriptionUpdate) -> ApplyOutcome {
        let before = self.clone();

        if let Some(last) = self.last_event_at {
            if update.observed_at < last {
                if self.stripe_customer_id.is_none() {
                    self.stripe_customer_id = update.stripe_customer_id.clone();
                }
                if self.stripe_subscription_id.is_none() {
                    self.stripe_subscription_id = update.stripe_subscription_id.clone();
                }
                return if *self == before {
                    ApplyOutcome::Stale
                } else {
                    ApplyOutcome::Applied
                };
            }
        }

        if let Some(customer_id) = &update.stripe_customer_id {
            self.stripe_customer_id = Some(customer_id.clone());
        }
        if let Some(subscription_id) = &update.stripe_subscription_id {
            self.stripe_subscription_id = Some(subscription_id.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
        }

        let accept_period = update.terminal
            || match (self.current_period_end, update.current_period_end) {
                (Some(current), Some(incoming)) => incoming >= current,
                _ => true,
            };
        if accept_period {
            let start = update.current_period_start.or(self.current_period_start);
            let end = update.current_period_end.or(self.current_period_end);
            let inverted = matches!((start, end), (Some(s), Some(e)) if e <= s);
            if update.terminal || !inverted {
                self.current_period_start = start;
                self.current_period_end = end;
            }
        }

        if let Some(cancel_at_period_end) = update.cancel_at_period_end {
            self.cancel_at_period_end = cancel_at_period_end;
        }
        if update.trial_end.is_some() {
            self.trial_end = update.trial_end;
        }

        self.last_event_at = Some(match self.last_event_at {
            Some(last) if last > update.observed_at => last,
            _ => update.observed_at,
        });

        if *self == before {
            ApplyOutcome::Unchanged
        } else {
            ApplyOutcome::Applied
        }
    }
}

/// A provider-sourced change to a subscription record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    /// When the provider produced this state (event creation time)
    pub observed_at: OffsetDateTime,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub trial_end: Option<OffsetDateTime>,
    /// Deletion: the period end may move backwards
    pub terminal: bool,
}

impl SubscriptionUpdate {
    pub fn new(observed_at: OffsetDateTime) -> Self {
        Self {
            observed_at,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            status: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: None,
            trial_end: None,
            terminal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
    Stale,
}
