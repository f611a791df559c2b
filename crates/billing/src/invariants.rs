//! Billing Invariants Module
//!
//! Runnable consistency checks over the billing tables. The worker runs the
//! full set on a schedule; a check can also be run by name after a suspect
//! migration or webhook replay.
//!
//! Checks only read, never repair. A violation carries enough context to
//! debug without re-querying.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use mailtide_shared::types::{PlanId, TransitionKind};

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{Organization, ORG_COLUMNS};

/// Events stuck in `processing` longer than this are presumed orphaned by a
/// crashed handler; twice the default claim-recovery window.
const STUCK_EVENT_MINUTES: i32 = 60;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Organization(s) affected; empty for system-level rows.
    pub org_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customers may be charged or limited incorrectly.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
    /// Minor inconsistency, informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of a full invariant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    event_ref: String,
    processing_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct UnknownKindRow {
    org_id: Uuid,
    event_type: String,
    row_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeCounterRow {
    org_id: Uuid,
    month: Date,
    contacts_imported: i64,
    campaigns_created: i64,
    emails_sent: i64,
    templates_created: i64,
    domains_verified: i64,
    api_calls: i64,
    ab_tests_created: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OrgNameRow {
    id: Uuid,
    name: String,
}

/// Service for running billing invariant checks.
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
    catalog: Arc<PlanCatalog>,
}

impl InvariantChecker {
    pub fn new(catalog: Arc<PlanCatalog>, pool: PgPool) -> Self {
        Self { pool, catalog }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_limits_match_catalog().await?);
        violations.extend(self.check_expired_still_active().await?);
        violations.extend(self.check_stuck_processing_events().await?);
        violations.extend(self.check_unknown_transition_kinds().await?);
        violations.extend(self.check_negative_usage_counters().await?);
        violations.extend(self.check_canceled_marked_active().await?);
        violations.extend(self.check_trial_without_end().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: an organization's stored limit columns match its plan's
    /// catalog definition. Drift here means some transition wrote a plan
    /// without its limits, the exact partial write the state machine exists
    /// to prevent.
    async fn check_limits_match_catalog(&self) -> BillingResult<Vec<InvariantViolation>> {
        let orgs: Vec<Organization> = sqlx::query_as(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE status <> 'canceled'"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let mut violations = Vec::new();
        for org in orgs {
            let Some(def) = self.catalog.resolve_plan_str(&org.plan) else {
                violations.push(InvariantViolation {
                    invariant: "limits_match_catalog".to_string(),
                    org_ids: vec![org.id],
                    description: format!(
                        "Organization '{}' carries plan '{}' which is not in the catalog",
                        org.name, org.plan
                    ),
                    context: serde_json::json!({ "plan": org.plan }),
                    severity: ViolationSeverity::High,
                });
                continue;
            };
            if org.contacts_limit != def.contacts_limit
                || org.campaigns_limit != def.campaigns_limit
                || org.emails_per_month_limit != def.emails_per_month_limit
            {
                violations.push(InvariantViolation {
                    invariant: "limits_match_catalog".to_string(),
                    org_ids: vec![org.id],
                    description: format!(
                        "Organization '{}' on plan '{}' has drifted limit columns",
                        org.name, org.plan
                    ),
                    context: serde_json::json!({
                        "plan": org.plan,
                        "stored": {
                            "contacts": org.contacts_limit,
                            "campaigns": org.campaigns_limit,
                            "emails": org.emails_per_month_limit,
                        },
                        "catalog": {
                            "contacts": def.contacts_limit,
                            "campaigns": def.campaigns_limit,
                            "emails": def.emails_per_month_limit,
                        },
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 2: no organization is still marked usable more than an hour
    /// past its authoritative end date. An hour of slack covers a late sweep
    /// tick; longer means the sweep is broken.
    async fn check_expired_still_active(&self) -> BillingResult<Vec<InvariantViolation>> {
        let orgs: Vec<Organization> = sqlx::query_as(&format!(
            r#"
            SELECT {ORG_COLUMNS} FROM organizations
            WHERE status IN ('active', 'trialing', 'past_due')
              AND (
                    (plan = $1 AND trial_ends_at IS NOT NULL
                     AND trial_ends_at < NOW() - INTERVAL '1 hour')
                 OR (plan <> $1 AND period_ends_at IS NOT NULL
                     AND period_ends_at < NOW() - INTERVAL '1 hour')
              )
            "#
        ))
        .bind(PlanId::FreeTrial.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(orgs
            .into_iter()
            .map(|org| InvariantViolation {
                invariant: "expired_still_active".to_string(),
                org_ids: vec![org.id],
                description: format!(
                    "Organization '{}' is '{}' but its end date passed over an hour ago",
                    org.name, org.status
                ),
                context: serde_json::json!({
                    "plan": org.plan,
                    "status": org.status,
                    "trial_ends_at": org.trial_ends_at.map(|t| t.to_string()),
                    "period_ends_at": org.period_ends_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: no webhook event is stuck in `processing`. The claim
    /// recovery window hands these back to redeliveries; rows older than the
    /// checker's threshold have had no redelivery to rescue them.
    async fn check_stuck_processing_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT event_ref, processing_started_at
            FROM processed_webhook_events
            WHERE status = 'processing'
              AND processing_started_at < NOW() - make_interval(mins => $1::int)
            "#,
        )
        .bind(STUCK_EVENT_MINUTES)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stuck_processing_events".to_string(),
                org_ids: vec![],
                description: format!(
                    "Webhook event '{}' has been in processing for over {} minutes",
                    row.event_ref, STUCK_EVENT_MINUTES
                ),
                context: serde_json::json!({
                    "event_ref": row.event_ref,
                    "processing_started_at": row.processing_started_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: every transition history row carries a known kind.
    /// Unknown kinds mean a writer bypassed the `TransitionKind` enum.
    async fn check_unknown_transition_kinds(&self) -> BillingResult<Vec<InvariantViolation>> {
        let known: Vec<String> = [
            TransitionKind::Created,
            TransitionKind::Updated,
            TransitionKind::Canceled,
            TransitionKind::Renewed,
            TransitionKind::PaymentSucceeded,
            TransitionKind::PaymentFailed,
            TransitionKind::TrialStarted,
            TransitionKind::TrialEnded,
            TransitionKind::PlanChanged,
        ]
        .iter()
        .map(|k| k.as_str().to_string())
        .collect();

        let rows: Vec<UnknownKindRow> = sqlx::query_as(
            r#"
            SELECT org_id, event_type, COUNT(*) as row_count
            FROM subscription_transitions
            WHERE event_type <> ALL($1)
            GROUP BY org_id, event_type
            "#,
        )
        .bind(&known)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unknown_transition_kinds".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "{} transition row(s) carry unknown kind '{}'",
                    row.row_count, row.event_type
                ),
                context: serde_json::json!({
                    "event_type": row.event_type,
                    "row_count": row.row_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: usage counters never go negative. Increments validate
    /// amounts, so a negative counter means direct table writes.
    async fn check_negative_usage_counters(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeCounterRow> = sqlx::query_as(
            r#"
            SELECT org_id, month, contacts_imported, campaigns_created,
                   emails_sent, templates_created, domains_verified, api_calls,
                   ab_tests_created
            FROM usage_records
            WHERE contacts_imported < 0 OR campaigns_created < 0 OR emails_sent < 0
               OR templates_created < 0 OR domains_verified < 0 OR api_calls < 0
               OR ab_tests_created < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "negative_usage_counters".to_string(),
                org_ids: vec![row.org_id],
                description: format!("Negative usage counter in month {}", row.month),
                context: serde_json::json!({
                    "month": row.month.to_string(),
                    "contacts_imported": row.contacts_imported,
                    "campaigns_created": row.campaigns_created,
                    "emails_sent": row.emails_sent,
                    "templates_created": row.templates_created,
                    "domains_verified": row.domains_verified,
                    "api_calls": row.api_calls,
                    "ab_tests_created": row.ab_tests_created,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 6: `canceled` and `is_active` never contradict.
    async fn check_canceled_marked_active(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrgNameRow> = sqlx::query_as(
            r#"
            SELECT id, name FROM organizations
            WHERE status = 'canceled' AND is_active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_marked_active".to_string(),
                org_ids: vec![row.id],
                description: format!(
                    "Organization '{}' is canceled but still flagged active",
                    row.name
                ),
                context: serde_json::json!({}),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 7: a trialing organization always has a trial end date; the
    /// sweep cannot expire what has no deadline.
    async fn check_trial_without_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrgNameRow> = sqlx::query_as(
            r#"
            SELECT id, name FROM organizations
            WHERE plan = $1 AND status = 'trialing' AND trial_ends_at IS NULL
            "#,
        )
        .bind(PlanId::FreeTrial.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "trial_without_end".to_string(),
                org_ids: vec![row.id],
                description: format!("Trialing organization '{}' has no trial end date", row.name),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "limits_match_catalog" => self.check_limits_match_catalog().await,
            "expired_still_active" => self.check_expired_still_active().await,
            "stuck_processing_events" => self.check_stuck_processing_events().await,
            "unknown_transition_kinds" => self.check_unknown_transition_kinds().await,
            "negative_usage_counters" => self.check_negative_usage_counters().await,
            "canceled_marked_active" => self.check_canceled_marked_active().await,
            "trial_without_end" => self.check_trial_without_end().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "limits_match_catalog",
            "expired_still_active",
            "stuck_processing_events",
            "unknown_transition_kinds",
            "negative_usage_counters",
            "canceled_marked_active",
            "trial_without_end",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"limits_match_catalog"));
        assert!(checks.contains(&"negative_usage_counters"));
    }

    #[test]
    fn test_violation_serializes_with_context() {
        let violation = InvariantViolation {
            invariant: "limits_match_catalog".to_string(),
            org_ids: vec![Uuid::new_v4()],
            description: "drift".to_string(),
            context: serde_json::json!({ "plan": "pro_monthly" }),
            severity: ViolationSeverity::Critical,
        };
        let json = serde_json::to_value(&violation).expect("serialize");
        assert_eq!(json["severity"], serde_json::json!("Critical"));
        assert_eq!(json["context"]["plan"], serde_json::json!("pro_monthly"));
    }
}
