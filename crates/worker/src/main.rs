#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Billgate Background Worker
//!
//! Operator commands and scheduled jobs:
//! - `run`: reconcile records whose paid period elapsed (hourly)
//! - `sync <email>`: re-sync one user's subscription from Stripe
//! - `events [--failed]`: list recently received webhook events

use std::sync::Arc;
use std::time::Duration;

use billgate_billing::{
    BillingService, EventLedger, EventProcessingResult, PgStore, ReconcileReport,
};
use billgate_shared::create_pool;
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Records checked per reconcile run
const RECONCILE_BATCH: i64 = 200;

const EVENTS_PAGE: i64 = 50;

/// Billgate background worker and operator commands
#[derive(Debug, Parser)]
#[command(name = "billgate-worker", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Run the scheduled jobs (default)
    Run,

    /// Re-sync one user's subscription from Stripe
    Sync {
        /// Email address of the account
        email: String,
    },

    /// List recently received webhook events
    Events {
        /// Only events whose processing failed
        #[arg(long)]
        failed: bool,
    },
}

impl Cli {
    fn into_command(self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }
}

fn format_period_end(value: Option<OffsetDateTime>) -> String {
    value
        .map(|at| at.to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn log_reconcile(report: &ReconcileReport) {
    if report.failed > 0 {
        warn!(
            checked = report.checked,
            updated = report.updated,
            failed = report.failed,
            "Reconcile cycle finished with failures"
        );
    } else {
        info!(
            checked = report.checked,
            updated = report.updated,
            "Reconcile cycle complete"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let command = Cli::parse().into_command();

    let database_url = dotenvy::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    match command {
        Commands::Events { failed } => list_events(pool, failed).await,
        Commands::Sync { email } => {
            let billing = BillingService::from_env(pool, "")?;
            sync_one(&billing, &email).await
        }
        Commands::Run => {
            let billing = Arc::new(BillingService::from_env(pool, "")?);
            run_scheduler(billing).await
        }
    }
}

async fn list_events(pool: sqlx::PgPool, failed_only: bool) -> anyhow::Result<()> {
    let ledger = PgStore::new(pool);
    let filter = failed_only.then_some(EventProcessingResult::Error);
    let events = ledger.list_events(filter, EVENTS_PAGE, 0).await?;

    if events.is_empty() {
        println!("No webhook events recorded");
        return Ok(());
    }

    for event in events {
        println!(
            "{}  {:<40} {:<10} {}{}",
            event.event_timestamp,
            event.event_type,
            event.processing_result,
            event.stripe_event_id,
            event
                .error_message
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn sync_one(billing: &BillingService, email: &str) -> anyhow::Result<()> {
    let report = billing.subscriptions.sync_for_email(email).await?;

    println!("User:            {} ({})", email, report.user_id);
    println!(
        "Status:          {} -> {}",
        report.before.status, report.after.status
    );
    println!(
        "Period end:      {} -> {}",
        format_period_end(report.before.current_period_end),
        format_period_end(report.after.current_period_end)
    );
    println!(
        "Cancel at end:   {} -> {}",
        report.before.cancel_at_period_end, report.after.cancel_at_period_end
    );
    println!("Outcome:         {:?}", report.outcome);
    Ok(())
}

async fn run_scheduler(billing: Arc<BillingService>) -> anyhow::Result<()> {
    info!("Starting Billgate Worker");

    let scheduler = JobScheduler::new().await?;

    // At minute 5 past every hour
    let subscriptions = billing.subscriptions.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let subscriptions = subscriptions.clone();
            Box::pin(async move {
                info!("Running scheduled reconcile of elapsed subscriptions");
                match subscriptions
                    .reconcile_elapsed(OffsetDateTime::now_utc(), RECONCILE_BATCH)
                    .await
                {
                    Ok(report) => log_reconcile(&report),
                    Err(e) => error!(error = %e, "Reconcile cycle failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: elapsed subscription reconcile (hourly)");

    scheduler.start().await?;
    info!("Billgate Worker started");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
