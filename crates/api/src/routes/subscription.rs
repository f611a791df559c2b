//! Subscription management routes
//!
//! These stay reachable for expired and canceled organizations; the gate
//! exempts them so a lapsed customer can still see their state and pay.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use mailtide_billing::subscriptions::{ChangePlanOptions, PlanChangeSource};
use mailtide_billing::sweep::days_remaining;
use mailtide_billing::{subscription_active, LimitCheck, PlanCatalog, TransitionRow, UsageSnapshot};
use mailtide_shared::types::PlanId;

use crate::error::{ApiError, ApiResult};
use crate::middleware::org_id_from_headers;
use crate::state::AppState;

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PlanLimits {
    pub contacts: i64,
    pub campaigns: i64,
    pub emails_per_month: i64,
    /// `null` is unlimited.
    pub templates: Option<i64>,
    pub domains: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionDetails {
    pub plan: String,
    pub plan_name: String,
    pub status: String,
    pub billing_cycle: String,
    pub price_cents: i64,
    pub is_trial: bool,
    pub is_active: bool,
    pub is_expired: bool,
    pub days_remaining: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_ends_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub pending_plan: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pending_plan_at: Option<OffsetDateTime>,
    pub limits: PlanLimits,
    pub features: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: SubscriptionDetails,
    pub recent_transitions: Vec<TransitionRow>,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub month: String,
    pub usage: UsageSnapshot,
    pub resources: Vec<LimitCheck>,
}

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManageAction {
    Upgrade,
    Downgrade,
    Cancel,
    Resume,
}

#[derive(Debug, Deserialize)]
pub struct ManageRequest {
    pub action: ManageAction,
    /// Target plan; required for upgrade and downgrade.
    pub plan: Option<String>,
    /// Required for plan changes; optional for cancel (defaults to period
    /// end). There is no safe default for a downgrade's timing.
    pub immediate: Option<bool>,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn get_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SubscriptionResponse>> {
    let org_id = org_id_from_headers(&headers)?;
    let org = state.billing.subscriptions.get(org_id).await?;
    let def = state.billing.catalog.get_or_trial(org.plan_id());

    let now = OffsetDateTime::now_utc();
    let expiry = org.authoritative_expiry();
    let is_expired = expiry.is_some_and(|e| e <= now);

    let recent_transitions = state.billing.history.recent_for_org(org_id, 10).await?;

    Ok(Json(SubscriptionResponse {
        subscription: SubscriptionDetails {
            plan: org.plan.clone(),
            plan_name: def.display_name.to_string(),
            status: org.status.clone(),
            billing_cycle: org.billing_cycle.clone(),
            price_cents: def.price_cents,
            is_trial: org.plan_id().is_trial(),
            is_active: subscription_active(&org, now),
            is_expired,
            days_remaining: expiry.map(|e| days_remaining(e, now)),
            trial_ends_at: org.trial_ends_at,
            period_ends_at: org.period_ends_at,
            cancel_at_period_end: org.cancel_at_period_end,
            pending_plan: org.pending_plan.clone(),
            pending_plan_at: org.pending_plan_at,
            limits: PlanLimits {
                contacts: org.contacts_limit,
                campaigns: org.campaigns_limit,
                emails_per_month: org.emails_per_month_limit,
                templates: def.templates_limit,
                domains: def.domains_limit,
            },
            features: def.features.enabled().iter().map(|f| f.as_str()).collect(),
        },
        recent_transitions,
    }))
}

pub async fn manage_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ManageRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let org_id = org_id_from_headers(&headers)?;

    match req.action {
        ManageAction::Upgrade | ManageAction::Downgrade => {
            let plan = req
                .plan
                .as_deref()
                .ok_or_else(|| ApiError::Validation("plan is required".to_string()))?;
            let target: PlanId = plan
                .parse()
                .map_err(|_| ApiError::Validation(format!("unknown plan: {plan}")))?;
            let immediate = req.immediate.ok_or_else(|| {
                ApiError::Validation("immediate must be specified for plan changes".to_string())
            })?;

            let org = state.billing.subscriptions.get(org_id).await?;
            let is_downgrade = PlanCatalog::is_downgrade(org.plan_id(), target);
            if req.action == ManageAction::Downgrade && !is_downgrade {
                return Err(ApiError::Validation(format!(
                    "{} -> {} is not a downgrade",
                    org.plan, target
                )));
            }
            if req.action == ManageAction::Upgrade && is_downgrade {
                return Err(ApiError::Validation(format!(
                    "{} -> {} is not an upgrade",
                    org.plan, target
                )));
            }

            let options = if immediate {
                ChangePlanOptions::immediate(PlanChangeSource::UserRequest)
            } else {
                ChangePlanOptions::at_period_end(PlanChangeSource::UserRequest)
            };
            let change = state
                .billing
                .subscriptions
                .change_plan(org_id, target, options)
                .await?;

            Ok(Json(json!({
                "action": if is_downgrade { "downgrade" } else { "upgrade" },
                "change": change,
            })))
        }
        ManageAction::Cancel => {
            let immediate = req.immediate.unwrap_or(false);
            let org = state.billing.subscriptions.cancel(org_id, immediate).await?;

            Ok(Json(json!({
                "action": "cancel",
                "status": org.status,
                "cancel_at_period_end": org.cancel_at_period_end,
                "period_ends_at": org.period_ends_at.map(format_rfc3339),
            })))
        }
        ManageAction::Resume => {
            let org = state.billing.subscriptions.resume(org_id).await?;

            Ok(Json(json!({
                "action": "resume",
                "status": org.status,
                "cancel_at_period_end": org.cancel_at_period_end,
            })))
        }
    }
}

pub async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<UsageResponse>> {
    let org_id = org_id_from_headers(&headers)?;

    let usage = state.billing.usage.current_usage(org_id).await?;
    let resources = state.billing.entitlements.resource_overview(org_id).await?;
    let month = mailtide_billing::usage::month_key(OffsetDateTime::now_utc());

    Ok(Json(UsageResponse {
        month: month.to_string(),
        usage,
        resources,
    }))
}

fn format_rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manage_action_parses_snake_case() {
        let req: ManageRequest =
            serde_json::from_str(r#"{"action":"upgrade","plan":"pro_monthly","immediate":true}"#)
                .expect("parse");
        assert_eq!(req.action, ManageAction::Upgrade);
        assert_eq!(req.plan.as_deref(), Some("pro_monthly"));
        assert_eq!(req.immediate, Some(true));
    }

    #[test]
    fn test_manage_request_fields_optional() {
        let req: ManageRequest =
            serde_json::from_str(r#"{"action":"resume"}"#).expect("parse");
        assert_eq!(req.action, ManageAction::Resume);
        assert!(req.plan.is_none());
        assert!(req.immediate.is_none());
    }

    #[test]
    fn test_unknown_action_rejected() {
        assert!(serde_json::from_str::<ManageRequest>(r#"{"action":"pause"}"#).is_err());
    }
}
