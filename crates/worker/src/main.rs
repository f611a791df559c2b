//! Mailtide Background Worker
//!
//! Handles scheduled jobs including:
//! - Trial and subscription expiration sweep (daily at 3:00 AM UTC)
//! - Invariant checks over billing state (daily at 4:00 AM UTC)
//! - Trial and subscription expiry reminders (daily at 9:00 AM UTC)
//! - Usage warning sweep at 90% of plan limits (every 6 hours)
//! - Scheduled plan change application (hourly)

use std::sync::Arc;
use std::time::Duration;

use mailtide_billing::{BillingService, ReminderSweepSummary};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of a reminder sweep
fn log_reminder_summary(label: &str, summary: &ReminderSweepSummary) {
    info!(
        examined = summary.examined,
        sent = summary.sent,
        suppressed = summary.suppressed,
        "{} reminder sweep complete",
        label
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Mailtide Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without billing config the sweeps cannot run; stay alive so the
            // deployment is visible rather than crash-looping
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire lapsed trials and subscriptions (daily at 3:00 AM UTC)
    // Runs after most payment-processor renewal webhooks have landed, so only
    // genuinely lapsed organizations are left to expire
    let expiration_sweep = billing.sweep.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let sweep = expiration_sweep.clone();
            Box::pin(async move {
                info!("Running expiration sweep");
                match sweep.run_expirations().await {
                    Ok(summary) => info!(
                        examined = summary.examined,
                        expired_trials = summary.expired_trials,
                        expired_subscriptions = summary.expired_subscriptions,
                        reset_to_trial = summary.reset_to_trial,
                        errors = summary.errors,
                        "Expiration sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Expiration sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiration sweep (daily at 3:00 AM UTC)");

    // Job 2: Billing invariant checks (daily at 4:00 AM UTC)
    let invariant_checker = billing.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => {
                        if summary.healthy {
                            info!(
                                checks_run = summary.checks_run,
                                "All billing invariants hold"
                            );
                        } else {
                            warn!(
                                checks_run = summary.checks_run,
                                checks_failed = summary.checks_failed,
                                violations = summary.violations.len(),
                                "Billing invariant violations found"
                            );
                            for v in &summary.violations {
                                warn!(
                                    invariant = %v.invariant,
                                    severity = %v.severity,
                                    orgs = v.org_ids.len(),
                                    "{}",
                                    v.description
                                );
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 4:00 AM UTC)");

    // Job 3: Trial and subscription expiry reminders (daily at 9:00 AM UTC)
    // Mid-morning UTC so reminder emails land during waking hours for the
    // bulk of customers
    let reminder_sweep = billing.sweep.clone();
    scheduler
        .add(Job::new_async("0 0 9 * * *", move |_uuid, _l| {
            let sweep = reminder_sweep.clone();
            Box::pin(async move {
                info!("Running expiry reminder sweeps");
                match sweep.run_trial_reminders().await {
                    Ok(summary) => log_reminder_summary("Trial", &summary),
                    Err(e) => error!(error = %e, "Trial reminder sweep failed"),
                }
                match sweep.run_subscription_reminders().await {
                    Ok(summary) => log_reminder_summary("Subscription", &summary),
                    Err(e) => error!(error = %e, "Subscription reminder sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiry reminders (daily at 9:00 AM UTC)");

    // Job 4: Usage warning sweep (every 6 hours)
    // Cron: At minute 0 past every 6th hour (0:00, 6:00, 12:00, 18:00 UTC)
    let usage_sweep = billing.sweep.clone();
    scheduler
        .add(Job::new_async("0 0 */6 * * *", move |_uuid, _l| {
            let sweep = usage_sweep.clone();
            Box::pin(async move {
                info!("Running usage warning sweep");
                match sweep.run_usage_warnings().await {
                    Ok(summary) => info!(
                        examined = summary.examined,
                        warned = summary.warned,
                        suppressed = summary.suppressed,
                        errors = summary.errors,
                        "Usage warning sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Usage warning sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Usage warning sweep (every 6 hours)");

    // Job 5: Apply scheduled plan changes (hourly)
    // Downgrades deferred to period end become effective here once the
    // period boundary passes
    let pending_sweep = billing.sweep.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let sweep = pending_sweep.clone();
            Box::pin(async move {
                info!("Running pending plan change sweep");
                match sweep.run_pending_plans().await {
                    Ok(summary) => info!(
                        examined = summary.examined,
                        applied = summary.applied,
                        errors = summary.errors,
                        "Pending plan change sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Pending plan change sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Pending plan changes (hourly)");

    // Job 6: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "Mailtide Worker started successfully with {} scheduled jobs",
        6
    );

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
