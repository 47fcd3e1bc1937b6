//! Postgres-backed store

use async_trait::async_trait;
use billgate_shared::Account;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    EventLedger, EventProcessingResult, SubscriptionStore, WebhookEventRecord,
    PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{ApplyOutcome, SubscriptionRecord, SubscriptionStatus, SubscriptionUpdate};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, status, stripe_customer_id, stripe_subscription_id,
    current_period_start, current_period_end, cancel_at_period_end,
    trial_end, last_event_at, created_at, updated_at
"#;

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    status: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    trial_end: Option<OffsetDateTime>,
    last_event_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            status: SubscriptionStatus::from_provider(&row.status),
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            trial_end: row.trial_end,
            last_event_at: row.last_event_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Store backed by the application database
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_one(
        &self,
        column: &str,
        value: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE {} = $1",
            SUBSCRIPTION_COLUMNS, column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Insert an empty record unless one exists, inside the caller's transaction
    async fn ensure_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, user_id, status, created_at, updated_at)
            VALUES ($1, $2, 'incomplete', NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn lock_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
    ) -> BillingResult<SubscriptionRecord> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.into())
    }

    async fn write_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = $2,
                stripe_customer_id = $3,
                stripe_subscription_id = $4,
                current_period_start = $5,
                current_period_end = $6,
                cancel_at_period_end = $7,
                trial_end = $8,
                last_event_at = $9,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(record.user_id)
        .bind(record.status.as_str())
        .bind(&record.stripe_customer_id)
        .bind(&record.stripe_subscription_id)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.trial_end)
        .bind(record.last_event_at)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.into())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn find_account(&self, user_id: Uuid) -> BillingResult<Option<Account>> {
        let account: Option<Account> = sqlx::query_as(
            r#"
            SELECT id, email, is_staff, is_superuser, is_active, date_joined
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn find_account_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        let account: Option<Account> = sqlx::query_as(
            r#"
            SELECT id, email, is_staff, is_superuser, is_active, date_joined
            FROM users WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_by_subscription_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.find_one("stripe_subscription_id", stripe_subscription_id)
            .await
    }

    async fn find_by_customer_id(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.find_one("stripe_customer_id", stripe_customer_id).await
    }

    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_row(&mut tx, user_id).await?;
        let record = Self::lock_row(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn link_customer(
        &self,
        user_id: Uuid,
        stripe_customer_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_row(&mut tx, user_id).await?;
        let mut record = Self::lock_row(&mut tx, user_id).await?;
        if record.stripe_customer_id.as_deref() != Some(stripe_customer_id) {
            record.stripe_customer_id = Some(stripe_customer_id.to_string());
            record = Self::write_row(&mut tx, &record).await?;
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn apply_update(
        &self,
        user_id: Uuid,
        update: &SubscriptionUpdate,
    ) -> BillingResult<(SubscriptionRecord, ApplyOutcome)> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_row(&mut tx, user_id).await?;
        let mut record = Self::lock_row(&mut tx, user_id).await?;

        let outcome = record.apply(update);
        if outcome == ApplyOutcome::Applied {
            record = Self::write_row(&mut tx, &record).await?;
        }
        tx.commit().await?;

        Ok((record, outcome))
    }

    async fn mark_cancel_requested(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                cancel_at_period_end = TRUE,
                updated_at = CASE WHEN cancel_at_period_end THEN updated_at ELSE NOW() END
            WHERE user_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into)
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))
    }

    async fn list_elapsed_active(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status IN ('active', 'trialing')
              AND stripe_subscription_id IS NOT NULL
              AND current_period_end <= $1
            ORDER BY current_period_end ASC
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl EventLedger for PgStore {
    async fn claim_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        // Only one concurrent delivery gets a row back. Failed and stuck events can be claimed again
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CASE
                    WHEN stripe_webhook_events.processing_result = 'error'
                    THEN stripe_webhook_events.error_message
                    ELSE CONCAT('Recovered from stuck state at ', NOW()::TEXT)
                END
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(stripe_event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %stripe_event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        Ok(claimed.is_some())
    }

    async fn finish_event(
        &self,
        stripe_event_id: &str,
        result: EventProcessingResult,
        error_message: Option<String>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(&error_message)
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(
        &self,
        result_filter: Option<EventProcessingResult>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let events: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, event_timestamp, processing_result,
                   processing_started_at, error_message, created_at
            FROM stripe_webhook_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(result_filter.map(|r| r.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
