//! Subflow background worker
//!
//! Handles scheduled jobs including:
//! - Checkout session expiry sweep (every 5 minutes)
//! - Scheduled plan changes at period end (every 15 minutes)
//! - Usage cycle resets (hourly)
//! - Trial-ending reminders (daily at 8:00 UTC)
//! - Subscription-expiry reminders (daily at 8:05 UTC)
//! - Status cache reconciliation (daily at 2:00 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use subflow_billing::{
    BillingConfig, BillingEventBuilder, BillingEventType, BillingService, ReminderRow,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// How many subscriptions one reconciliation pass examines.
const RECONCILE_BATCH: i64 = 500;

async fn emit_reminders(
    billing: &BillingService,
    rows: Vec<ReminderRow>,
    event_type: BillingEventType,
) {
    for row in rows {
        billing
            .events
            .emit(
                BillingEventBuilder::new(row.tenant_id, event_type).data(serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "at": row.at,
                })),
            )
            .await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Subflow worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = subflow_shared::create_pool(&database_url).await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without gateway credentials none of the jobs can do useful
            // work; stay alive so the deployment is visible, but do nothing.
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };
    let config = BillingConfig::from_env()?;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire stale checkout sessions (every 5 minutes)
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                match billing.checkout.expire_stale().await {
                    Ok(0) => {}
                    Ok(n) => info!(expired = n, "Expired stale checkout sessions"),
                    Err(e) => error!(error = %e, "Checkout expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Checkout expiry sweep (every 5 minutes)");

    // Job 2: Apply scheduled plan changes whose period has ended (every 15 minutes)
    let changes_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = changes_billing.clone();
            Box::pin(async move {
                match billing.subscriptions.apply_scheduled_changes().await {
                    Ok(summary) if summary.applied > 0 => info!(
                        applied = summary.applied,
                        upgrades = summary.upgrades,
                        downgrades = summary.downgrades,
                        "Applied scheduled plan changes"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Scheduled plan change job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Plan change application (every 15 minutes)");

    // Job 3: Reset elapsed usage cycles (hourly)
    let reset_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = reset_billing.clone();
            Box::pin(async move {
                match billing.usage.reset_expired_cycles().await {
                    Ok(0) => {}
                    Ok(n) => info!(reset = n, "Reset elapsed usage cycles"),
                    Err(e) => error!(error = %e, "Usage cycle reset failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Usage cycle reset (hourly)");

    // Job 4: Trial-ending reminders (daily at 8:00 UTC)
    let trial_billing = billing.clone();
    let trial_days = config.reminder_days_ahead;
    scheduler
        .add(Job::new_async("0 0 8 * * *", move |_uuid, _l| {
            let billing = trial_billing.clone();
            Box::pin(async move {
                match billing.subscriptions.trials_ending_on(trial_days).await {
                    Ok(rows) => {
                        let count = rows.len();
                        emit_reminders(&billing, rows, BillingEventType::TrialEndingSoon).await;
                        if count > 0 {
                            info!(count = count, days_ahead = trial_days, "Trial reminders sent");
                        }
                    }
                    Err(e) => error!(error = %e, "Trial reminder sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial-ending reminders (daily at 8:00 UTC)");

    // Job 5: Subscription-expiry reminders (daily at 8:05 UTC)
    let expiring_billing = billing.clone();
    let expiry_days = config.reminder_days_ahead;
    scheduler
        .add(Job::new_async("0 5 8 * * *", move |_uuid, _l| {
            let billing = expiring_billing.clone();
            Box::pin(async move {
                match billing.subscriptions.expiring_on(expiry_days).await {
                    Ok(rows) => {
                        let count = rows.len();
                        emit_reminders(&billing, rows, BillingEventType::SubscriptionEndingSoon)
                            .await;
                        if count > 0 {
                            info!(count = count, days_ahead = expiry_days, "Expiry reminders sent");
                        }
                    }
                    Err(e) => error!(error = %e, "Expiry reminder sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription-expiry reminders (daily at 8:05 UTC)");

    // Job 6: Reconcile stale status caches (daily at 2:00 UTC)
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                match billing
                    .subscriptions
                    .reconcile_status_cache(RECONCILE_BATCH)
                    .await
                {
                    Ok(0) => {}
                    Ok(n) => info!(reconciled = n, "Reconciled subscription status caches"),
                    Err(e) => error!(error = %e, "Status reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Status cache reconciliation (daily at 2:00 UTC)");

    // Job 7: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("30 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Subflow worker started with 7 scheduled jobs");

    // The scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
