//! Scheduled Sweep
//!
//! Reconciles time-based state that no single webhook triggers: trial and
//! subscription end-date reminders, expirations past their end date, usage
//! warnings, and scheduled plan changes that have come due.
//!
//! Every scan is idempotent. Expiry is "set to canceled if not already";
//! reminder and warning duplicates are suppressed by the notification
//! service's time windows, so overlapping sweep runs (restart, missed cron
//! tick catching up) cannot double-send. One bad row never aborts a scan;
//! errors are counted in the summary and the scan moves on.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use mailtide_shared::types::{NotificationKind, PlanId, ResourceKind};

use crate::catalog::PlanCatalog;
use crate::config::BillingConfig;
use crate::entitlement::effective_limit;
use crate::error::{BillingError, BillingResult};
use crate::notify::{NotificationOutcome, NotificationService};
use crate::subscriptions::{ExpiryKind, Organization, SubscriptionService, ORG_COLUMNS};
use crate::usage::UsageService;

/// Resources scanned for usage warnings.
const WARNED_RESOURCES: [ResourceKind; 5] = [
    ResourceKind::Contacts,
    ResourceKind::Campaigns,
    ResourceKind::Emails,
    ResourceKind::Templates,
    ResourceKind::Domains,
];

/// Whole days until `end`, rounded up; an end 6 days and one second away is
/// 7 days out. Past or exactly-now ends are 0.
pub fn days_remaining(end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (end - now).whole_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + 86_399) / 86_400
}

#[derive(Debug, Default, Serialize)]
pub struct ReminderSweepSummary {
    pub examined: usize,
    pub sent: usize,
    pub suppressed: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct ExpirationSweepSummary {
    pub examined: usize,
    pub expired_trials: usize,
    pub expired_subscriptions: usize,
    pub reset_to_trial: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct UsageWarningSummary {
    pub examined: usize,
    pub warned: usize,
    pub suppressed: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct PendingPlanSummary {
    pub examined: usize,
    pub applied: usize,
    pub errors: usize,
}

/// The periodic reconciliation job.
#[derive(Clone)]
pub struct SweepService {
    pool: PgPool,
    config: BillingConfig,
    catalog: Arc<PlanCatalog>,
    subscriptions: SubscriptionService,
    notifications: NotificationService,
    usage: UsageService,
}

impl SweepService {
    pub fn new(config: BillingConfig, catalog: Arc<PlanCatalog>, pool: PgPool) -> Self {
        let subscriptions = SubscriptionService::new(config.clone(), catalog.clone(), pool.clone());
        let notifications =
            NotificationService::new(pool.clone(), config.notification_callback_url.clone());
        let usage = UsageService::new(pool.clone());
        Self {
            pool,
            config,
            catalog,
            subscriptions,
            notifications,
            usage,
        }
    }

    // =========================================================================
    // TRIAL / SUBSCRIPTION REMINDERS
    // =========================================================================

    /// Remind trialing organizations whose trial ends in one of the
    /// configured day offsets.
    pub async fn run_trial_reminders(&self) -> BillingResult<ReminderSweepSummary> {
        let mut summary = ReminderSweepSummary::default();
        let Some(&max_days) = self.config.trial_reminder_days.iter().max() else {
            return Ok(summary);
        };

        let orgs: Vec<Organization> = sqlx::query_as(&format!(
            r#"
            SELECT {ORG_COLUMNS} FROM organizations
            WHERE plan = $1 AND status = 'trialing'
              AND trial_ends_at IS NOT NULL
              AND trial_ends_at > NOW()
              AND trial_ends_at <= NOW() + make_interval(days => $2::int)
            "#
        ))
        .bind(PlanId::FreeTrial.as_str())
        .bind(max_days as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let now = OffsetDateTime::now_utc();
        for org in orgs {
            summary.examined += 1;
            let Some(trial_end) = org.trial_ends_at else {
                continue;
            };
            let days = days_remaining(trial_end, now);
            if !self.config.trial_reminder_days.contains(&days) {
                continue;
            }
            match self
                .notifications
                .notify(
                    org.id,
                    NotificationKind::TrialEndingSoon,
                    serde_json::json!({
                        "days_remaining": days,
                        "trial_ends_at": trial_end.to_string(),
                    }),
                )
                .await
            {
                Ok(NotificationOutcome::Dispatched) => summary.sent += 1,
                Ok(NotificationOutcome::Suppressed) => summary.suppressed += 1,
                Err(e) => {
                    tracing::warn!(org_id = %org.id, error = %e, "Trial reminder failed");
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            sent = summary.sent,
            suppressed = summary.suppressed,
            "Trial reminder sweep complete"
        );
        Ok(summary)
    }

    /// Remind organizations that chose cancel-at-period-end and are about to
    /// lose access. Renewing subscriptions get no reminder; they renew.
    pub async fn run_subscription_reminders(&self) -> BillingResult<ReminderSweepSummary> {
        let mut summary = ReminderSweepSummary::default();
        let Some(&max_days) = self.config.subscription_reminder_days.iter().max() else {
            return Ok(summary);
        };

        let orgs: Vec<Organization> = sqlx::query_as(&format!(
            r#"
            SELECT {ORG_COLUMNS} FROM organizations
            WHERE cancel_at_period_end = TRUE
              AND status <> 'canceled'
              AND period_ends_at IS NOT NULL
              AND period_ends_at > NOW()
              AND period_ends_at <= NOW() + make_interval(days => $1::int)
            "#
        ))
        .bind(max_days as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let now = OffsetDateTime::now_utc();
        for org in orgs {
            summary.examined += 1;
            let Some(period_end) = org.period_ends_at else {
                continue;
            };
            let days = days_remaining(period_end, now);
            if !self.config.subscription_reminder_days.contains(&days) {
                continue;
            }
            match self
                .notifications
                .notify(
                    org.id,
                    NotificationKind::SubscriptionEndingSoon,
                    serde_json::json!({
                        "days_remaining": days,
                        "period_ends_at": period_end.to_string(),
                        "plan": org.plan,
                    }),
                )
                .await
            {
                Ok(NotificationOutcome::Dispatched) => summary.sent += 1,
                Ok(NotificationOutcome::Suppressed) => summary.suppressed += 1,
                Err(e) => {
                    tracing::warn!(org_id = %org.id, error = %e, "Subscription reminder failed");
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            sent = summary.sent,
            suppressed = summary.suppressed,
            "Subscription reminder sweep complete"
        );
        Ok(summary)
    }

    // =========================================================================
    // EXPIRATIONS
    // =========================================================================

    /// Expire every organization whose authoritative end date has passed
    /// while it is still marked usable.
    pub async fn run_expirations(&self) -> BillingResult<ExpirationSweepSummary> {
        let mut summary = ExpirationSweepSummary::default();

        let candidates: Vec<Organization> = sqlx::query_as(&format!(
            r#"
            SELECT {ORG_COLUMNS} FROM organizations
            WHERE status <> 'canceled'
              AND (
                    (plan = $1 AND trial_ends_at IS NOT NULL AND trial_ends_at <= NOW())
                 OR (plan <> $1 AND period_ends_at IS NOT NULL AND period_ends_at <= NOW())
              )
            "#
        ))
        .bind(PlanId::FreeTrial.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        for org in candidates {
            summary.examined += 1;
            let expired = match self.subscriptions.expire(&org).await {
                Ok(Some(expired)) => expired,
                // Another sweep or a webhook got there first.
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(org_id = %org.id, error = %e, "Expiry transition failed");
                    summary.errors += 1;
                    continue;
                }
            };

            let (kind, metadata) = match expired.kind {
                ExpiryKind::Trial => {
                    summary.expired_trials += 1;
                    (
                        NotificationKind::TrialExpired,
                        serde_json::json!({ "plan": org.plan }),
                    )
                }
                ExpiryKind::Subscription => {
                    summary.expired_subscriptions += 1;
                    (
                        NotificationKind::SubscriptionExpired,
                        serde_json::json!({ "plan": org.plan }),
                    )
                }
                ExpiryKind::CanceledReset => {
                    summary.reset_to_trial += 1;
                    (
                        NotificationKind::SubscriptionExpired,
                        serde_json::json!({ "plan": org.plan, "reset_to_trial": true }),
                    )
                }
            };
            if let Err(e) = self.notifications.notify(org.id, kind, metadata).await {
                tracing::warn!(org_id = %org.id, error = %e, "Expiry notification failed");
            }
        }

        tracing::info!(
            examined = summary.examined,
            expired_trials = summary.expired_trials,
            expired_subscriptions = summary.expired_subscriptions,
            reset_to_trial = summary.reset_to_trial,
            errors = summary.errors,
            "Expiration sweep complete"
        );
        Ok(summary)
    }

    // =========================================================================
    // USAGE WARNINGS
    // =========================================================================

    /// Warn organizations approaching a resource limit. Fires between the
    /// configured warning percentage and the limit itself; once the limit is
    /// hit, the entitlement denial carries the message instead.
    pub async fn run_usage_warnings(&self) -> BillingResult<UsageWarningSummary> {
        let mut summary = UsageWarningSummary::default();

        let orgs: Vec<Organization> = sqlx::query_as(&format!(
            r#"
            SELECT {ORG_COLUMNS} FROM organizations
            WHERE status <> 'canceled' AND is_active = TRUE
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        for org in orgs {
            summary.examined += 1;
            let snapshot = match self.usage.current_usage(org.id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::error!(org_id = %org.id, error = %e, "Usage snapshot failed");
                    summary.errors += 1;
                    continue;
                }
            };
            let def = self.catalog.get_or_trial(org.plan_id());

            for resource in WARNED_RESOURCES {
                let Some(limit) = effective_limit(&org, def, resource) else {
                    continue;
                };
                if limit <= 0 {
                    continue;
                }
                let current = snapshot.current_for(resource);
                let percent = (current as f64 / limit as f64) * 100.0;
                if percent < self.config.usage_warning_percent as f64 || current >= limit {
                    continue;
                }
                match self
                    .notifications
                    .notify(
                        org.id,
                        NotificationKind::UsageWarning,
                        serde_json::json!({
                            "resource": resource.as_str(),
                            "percent_used": percent,
                            "current": current,
                            "limit": limit,
                        }),
                    )
                    .await
                {
                    Ok(NotificationOutcome::Dispatched) => summary.warned += 1,
                    Ok(NotificationOutcome::Suppressed) => summary.suppressed += 1,
                    Err(e) => {
                        tracing::warn!(
                            org_id = %org.id,
                            resource = %resource,
                            error = %e,
                            "Usage warning failed"
                        );
                    }
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            warned = summary.warned,
            suppressed = summary.suppressed,
            errors = summary.errors,
            "Usage warning sweep complete"
        );
        Ok(summary)
    }

    // =========================================================================
    // SCHEDULED PLAN CHANGES
    // =========================================================================

    /// Apply at-period-end plan changes whose effective date has arrived.
    pub async fn run_pending_plans(&self) -> BillingResult<PendingPlanSummary> {
        let mut summary = PendingPlanSummary::default();

        let orgs: Vec<Organization> = sqlx::query_as(&format!(
            r#"
            SELECT {ORG_COLUMNS} FROM organizations
            WHERE pending_plan IS NOT NULL
              AND pending_plan_at IS NOT NULL
              AND pending_plan_at <= NOW()
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        for org in orgs {
            summary.examined += 1;
            match self.subscriptions.apply_pending_plan(&org).await {
                Ok(updated) => {
                    summary.applied += 1;
                    if let Err(e) = self
                        .notifications
                        .notify(
                            org.id,
                            NotificationKind::PlanChanged,
                            serde_json::json!({
                                "from": org.plan,
                                "to": updated.plan,
                                "scheduled": true,
                            }),
                        )
                        .await
                    {
                        tracing::warn!(org_id = %org.id, error = %e, "Plan change notification failed");
                    }
                }
                Err(e) => {
                    tracing::error!(org_id = %org.id, error = %e, "Pending plan apply failed");
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            applied = summary.applied,
            errors = summary.errors,
            "Pending plan sweep complete"
        );
        Ok(summary)
    }
}
