//! Entitlement Gate
//!
//! Answers the three questions product code asks before serving a request:
//!
//! 1. Is this organization's subscription usable right now?
//! 2. Does its plan include feature X?
//! 3. May it create one more of resource Y?
//!
//! Decisions are pure functions over the organization row, the plan catalog,
//! and a usage snapshot; the service wrapper only loads those inputs. A
//! denial is a normal answer, not an error.
//!
//! Failure posture is closed: unknown plan strings resolve to trial limits
//! and the minimal feature set, unknown statuses read as canceled.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use mailtide_shared::types::{ResourceKind, SubscriptionStatus};

use crate::catalog::{FeatureFlag, PlanCatalog, PlanDefinition};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{Organization, ORG_COLUMNS};
use crate::usage::UsageService;

/// Machine-readable reason for a denial, stable across releases; clients
/// branch on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCode {
    SubscriptionExpired,
    PaymentPastDue,
    SubscriptionCanceled,
    FeatureNotAvailable,
    ContactLimitReached,
    CampaignLimitReached,
    EmailLimitReached,
    TemplateLimitReached,
    DomainLimitReached,
}

impl DenyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyCode::SubscriptionExpired => "subscription_expired",
            DenyCode::PaymentPastDue => "payment_past_due",
            DenyCode::SubscriptionCanceled => "subscription_canceled",
            DenyCode::FeatureNotAvailable => "feature_not_available",
            DenyCode::ContactLimitReached => "contact_limit_reached",
            DenyCode::CampaignLimitReached => "campaign_limit_reached",
            DenyCode::EmailLimitReached => "email_limit_reached",
            DenyCode::TemplateLimitReached => "template_limit_reached",
            DenyCode::DomainLimitReached => "domain_limit_reached",
        }
    }

    /// Denials caused by subscription state (fixable by paying) versus plan
    /// shape (fixable by upgrading).
    pub fn is_subscription_state(&self) -> bool {
        matches!(
            self,
            DenyCode::SubscriptionExpired
                | DenyCode::PaymentPastDue
                | DenyCode::SubscriptionCanceled
        )
    }
}

impl std::fmt::Display for DenyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of an entitlement check.
#[derive(Debug, Clone, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<DenyCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AccessDecision {
    pub fn granted() -> Self {
        Self {
            allowed: true,
            code: None,
            message: None,
        }
    }

    pub fn denied(code: DenyCode, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            code: Some(code),
            message: Some(message.into()),
        }
    }

    pub fn is_granted(&self) -> bool {
        self.allowed
    }
}

/// One resource's position against its limit.
#[derive(Debug, Clone, Serialize)]
pub struct LimitCheck {
    pub resource: ResourceKind,
    pub current: i64,
    /// `None` is unlimited.
    pub limit: Option<i64>,
    pub allowed: bool,
    pub percent_used: Option<f64>,
}

// =============================================================================
// PURE DECISIONS
// =============================================================================

/// Subscription usability. `past_due` keeps access while the grace window
/// (carried in `period_ends_at`) is open; everything turns on the row's
/// authoritative expiry timestamp, never on wall-clock sweeps having run.
pub fn subscription_gate(org: &Organization, now: OffsetDateTime) -> Result<(), DenyCode> {
    let lapsed = org.authoritative_expiry().is_some_and(|e| e <= now);
    match org.status_id() {
        SubscriptionStatus::Canceled => Err(DenyCode::SubscriptionCanceled),
        SubscriptionStatus::PastDue => {
            if lapsed {
                Err(DenyCode::PaymentPastDue)
            } else {
                Ok(())
            }
        }
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => {
            if lapsed {
                Err(DenyCode::SubscriptionExpired)
            } else {
                Ok(())
            }
        }
    }
}

pub fn subscription_active(org: &Organization, now: OffsetDateTime) -> bool {
    subscription_gate(org, now).is_ok()
}

/// The limit a resource is enforced against. Contacts, campaigns, and emails
/// come from the organization row (they move atomically with the plan);
/// template and domain limits live only in the catalog.
pub fn effective_limit(
    org: &Organization,
    def: &PlanDefinition,
    resource: ResourceKind,
) -> Option<i64> {
    match resource {
        ResourceKind::Contacts => Some(org.contacts_limit),
        ResourceKind::Campaigns => Some(org.campaigns_limit),
        ResourceKind::Emails => Some(org.emails_per_month_limit),
        _ => def.limit_for(resource),
    }
}

/// May one more be created? Strictly `current < limit`: an organization at
/// exactly its limit is full.
pub fn check_limit(resource: ResourceKind, current: i64, limit: Option<i64>) -> LimitCheck {
    let allowed = limit.is_none_or(|l| current < l);
    let percent_used = limit
        .filter(|l| *l > 0)
        .map(|l| (current as f64 / l as f64) * 100.0);
    LimitCheck {
        resource,
        current,
        limit,
        allowed,
        percent_used,
    }
}

/// Denial code for a full resource. Untracked resources (`None`) can never
/// deny on quantity.
pub fn limit_deny_code(resource: ResourceKind) -> Option<DenyCode> {
    match resource {
        ResourceKind::Contacts => Some(DenyCode::ContactLimitReached),
        ResourceKind::Campaigns => Some(DenyCode::CampaignLimitReached),
        ResourceKind::Emails => Some(DenyCode::EmailLimitReached),
        ResourceKind::Templates => Some(DenyCode::TemplateLimitReached),
        ResourceKind::Domains => Some(DenyCode::DomainLimitReached),
        ResourceKind::ApiCalls | ResourceKind::AbTests => None,
    }
}

fn gate_message(code: DenyCode) -> &'static str {
    match code {
        DenyCode::SubscriptionCanceled => "subscription canceled; choose a plan to continue",
        DenyCode::PaymentPastDue => {
            "payment past due and grace period exhausted; update your payment method"
        }
        _ => "subscription period has ended; renew to continue",
    }
}

// =============================================================================
// SERVICE
// =============================================================================

/// Resources shown in the usage overview, in display order.
const OVERVIEW_RESOURCES: [ResourceKind; 5] = [
    ResourceKind::Contacts,
    ResourceKind::Campaigns,
    ResourceKind::Emails,
    ResourceKind::Templates,
    ResourceKind::Domains,
];

/// Entitlement checks backed by the organization row and usage counters.
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    catalog: Arc<PlanCatalog>,
    usage: UsageService,
}

impl EntitlementService {
    pub fn new(catalog: Arc<PlanCatalog>, pool: PgPool) -> Self {
        let usage = UsageService::new(pool.clone());
        Self {
            pool,
            catalog,
            usage,
        }
    }

    async fn load_org(&self, org_id: Uuid) -> BillingResult<Organization> {
        let org: Option<Organization> =
            sqlx::query_as(&format!("SELECT {ORG_COLUMNS} FROM organizations WHERE id = $1"))
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        org.ok_or_else(|| BillingError::UnresolvedTarget(format!("organization {}", org_id)))
    }

    /// Question 1: is the subscription usable right now?
    pub async fn check_subscription(&self, org_id: Uuid) -> BillingResult<AccessDecision> {
        let org = self.load_org(org_id).await?;
        match subscription_gate(&org, OffsetDateTime::now_utc()) {
            Ok(()) => Ok(AccessDecision::granted()),
            Err(code) => {
                tracing::debug!(org_id = %org_id, code = %code, "Subscription gate denied");
                Ok(AccessDecision::denied(code, gate_message(code)))
            }
        }
    }

    /// Question 2: does the plan include this feature? An unusable
    /// subscription denies every feature regardless of plan.
    pub async fn check_feature(
        &self,
        org_id: Uuid,
        flag: FeatureFlag,
    ) -> BillingResult<AccessDecision> {
        let org = self.load_org(org_id).await?;
        if let Err(code) = subscription_gate(&org, OffsetDateTime::now_utc()) {
            return Ok(AccessDecision::denied(code, gate_message(code)));
        }
        let def = self.catalog.get_or_trial(org.plan_id());
        if def.features.has(flag) {
            Ok(AccessDecision::granted())
        } else {
            Ok(AccessDecision::denied(
                DenyCode::FeatureNotAvailable,
                format!("feature {} is not included in plan {}", flag, org.plan),
            ))
        }
    }

    /// Question 3: may the organization create one more of this resource?
    pub async fn check_resource(
        &self,
        org_id: Uuid,
        resource: ResourceKind,
    ) -> BillingResult<AccessDecision> {
        let org = self.load_org(org_id).await?;
        if let Err(code) = subscription_gate(&org, OffsetDateTime::now_utc()) {
            return Ok(AccessDecision::denied(code, gate_message(code)));
        }
        let Some(code) = limit_deny_code(resource) else {
            return Ok(AccessDecision::granted());
        };
        let def = self.catalog.get_or_trial(org.plan_id());
        let limit = effective_limit(&org, def, resource);
        let snapshot = self.usage.current_usage(org_id).await?;
        let check = check_limit(resource, snapshot.current_for(resource), limit);
        if check.allowed {
            Ok(AccessDecision::granted())
        } else {
            Ok(AccessDecision::denied(
                code,
                format!(
                    "{} limit reached ({} of {} used)",
                    resource,
                    check.current,
                    check.limit.unwrap_or(0)
                ),
            ))
        }
    }

    /// Every limited resource's position, for the usage dashboard.
    pub async fn resource_overview(&self, org_id: Uuid) -> BillingResult<Vec<LimitCheck>> {
        let org = self.load_org(org_id).await?;
        let def = self.catalog.get_or_trial(org.plan_id());
        let snapshot = self.usage.current_usage(org_id).await?;
        Ok(OVERVIEW_RESOURCES
            .iter()
            .map(|&resource| {
                check_limit(
                    resource,
                    snapshot.current_for(resource),
                    effective_limit(&org, def, resource),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn org(status: &str, plan: &str) -> Organization {
        let now = OffsetDateTime::now_utc();
        Organization {
            id: Uuid::new_v4(),
            name: "Test".to_string(),
            plan: plan.to_string(),
            status: status.to_string(),
            billing_cycle: "monthly".to_string(),
            trial_ends_at: None,
            period_ends_at: Some(now + Duration::days(10)),
            cancel_at_period_end: false,
            is_active: true,
            processor_customer_ref: None,
            processor_subscription_ref: None,
            processor_price_ref: None,
            contacts_limit: 5_000,
            campaigns_limit: 50,
            emails_per_month_limit: 50_000,
            pending_plan: None,
            pending_plan_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_gate_active_within_period() {
        let org = org("active", "basic_monthly");
        assert!(subscription_gate(&org, OffsetDateTime::now_utc()).is_ok());
    }

    #[test]
    fn test_gate_active_lapsed_period() {
        let now = OffsetDateTime::now_utc();
        let mut org = org("active", "basic_monthly");
        org.period_ends_at = Some(now - Duration::hours(1));
        assert_eq!(
            subscription_gate(&org, now),
            Err(DenyCode::SubscriptionExpired)
        );
    }

    #[test]
    fn test_gate_trialing_uses_trial_end() {
        let now = OffsetDateTime::now_utc();
        let mut org = org("trialing", "free_trial");
        org.period_ends_at = None;
        org.trial_ends_at = Some(now - Duration::minutes(1));
        assert_eq!(
            subscription_gate(&org, now),
            Err(DenyCode::SubscriptionExpired)
        );

        org.trial_ends_at = Some(now + Duration::days(5));
        assert!(subscription_gate(&org, now).is_ok());
    }

    #[test]
    fn test_gate_past_due_within_grace() {
        let now = OffsetDateTime::now_utc();
        let mut org = org("past_due", "pro_monthly");
        org.period_ends_at = Some(now + Duration::days(2));
        assert!(subscription_gate(&org, now).is_ok());
    }

    #[test]
    fn test_gate_past_due_grace_exhausted() {
        let now = OffsetDateTime::now_utc();
        let mut org = org("past_due", "pro_monthly");
        org.period_ends_at = Some(now - Duration::minutes(30));
        assert_eq!(subscription_gate(&org, now), Err(DenyCode::PaymentPastDue));
    }

    #[test]
    fn test_gate_canceled_always_denied() {
        let now = OffsetDateTime::now_utc();
        let mut org = org("canceled", "pro_monthly");
        org.period_ends_at = Some(now + Duration::days(30));
        assert_eq!(
            subscription_gate(&org, now),
            Err(DenyCode::SubscriptionCanceled)
        );
    }

    #[test]
    fn test_gate_unknown_status_fails_closed() {
        let org = org("weird_status", "pro_monthly");
        assert_eq!(
            subscription_gate(&org, OffsetDateTime::now_utc()),
            Err(DenyCode::SubscriptionCanceled)
        );
    }

    #[test]
    fn test_gate_no_expiry_recorded_allows() {
        let mut org = org("active", "pro_monthly");
        org.period_ends_at = None;
        assert!(subscription_active(&org, OffsetDateTime::now_utc()));
    }

    #[test]
    fn test_check_limit_boundaries() {
        assert!(check_limit(ResourceKind::Contacts, 0, Some(10)).allowed);
        assert!(check_limit(ResourceKind::Contacts, 9, Some(10)).allowed);
        // At the limit is full.
        assert!(!check_limit(ResourceKind::Contacts, 10, Some(10)).allowed);
        assert!(!check_limit(ResourceKind::Contacts, 11, Some(10)).allowed);
        // Unlimited.
        assert!(check_limit(ResourceKind::Templates, 1_000_000, None).allowed);
    }

    #[test]
    fn test_check_limit_percent() {
        let check = check_limit(ResourceKind::Emails, 45_000, Some(50_000));
        assert_eq!(check.percent_used, Some(90.0));
        assert!(check.allowed);

        let unlimited = check_limit(ResourceKind::Templates, 5, None);
        assert_eq!(unlimited.percent_used, None);
    }

    #[test]
    fn test_effective_limit_sources() {
        let org = org("active", "basic_monthly");
        let def = PlanDefinition::basic(mailtide_shared::types::BillingCycle::Monthly);

        // The big three read the row, not the catalog.
        assert_eq!(
            effective_limit(&org, &def, ResourceKind::Contacts),
            Some(5_000)
        );
        assert_eq!(
            effective_limit(&org, &def, ResourceKind::Emails),
            Some(50_000)
        );
        // Templates and domains read the catalog.
        assert_eq!(
            effective_limit(&org, &def, ResourceKind::Templates),
            Some(10)
        );
        assert_eq!(effective_limit(&org, &def, ResourceKind::Domains), Some(1));
        // Untracked.
        assert_eq!(effective_limit(&org, &def, ResourceKind::ApiCalls), None);
    }

    #[test]
    fn test_limit_deny_codes() {
        assert_eq!(
            limit_deny_code(ResourceKind::Contacts),
            Some(DenyCode::ContactLimitReached)
        );
        assert_eq!(
            limit_deny_code(ResourceKind::Domains),
            Some(DenyCode::DomainLimitReached)
        );
        assert_eq!(limit_deny_code(ResourceKind::ApiCalls), None);
    }

    #[test]
    fn test_deny_code_classification() {
        assert!(DenyCode::PaymentPastDue.is_subscription_state());
        assert!(DenyCode::SubscriptionCanceled.is_subscription_state());
        assert!(!DenyCode::FeatureNotAvailable.is_subscription_state());
        assert!(!DenyCode::EmailLimitReached.is_subscription_state());
    }

    #[test]
    fn test_decision_serialization_omits_empty_fields() {
        let granted = serde_json::to_value(AccessDecision::granted()).expect("serialize");
        assert_eq!(granted, serde_json::json!({ "allowed": true }));

        let denied = serde_json::to_value(AccessDecision::denied(
            DenyCode::CampaignLimitReached,
            "campaigns limit reached (50 of 50 used)",
        ))
        .expect("serialize");
        assert_eq!(denied["allowed"], serde_json::json!(false));
        assert_eq!(denied["code"], serde_json::json!("campaign_limit_reached"));
    }
}
