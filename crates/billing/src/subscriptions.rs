//! Subscription State Machine
//!
//! Owns every mutation of an organization's plan/status/period fields. The
//! rest of the system (webhook dispatch, the sweep, the management routes)
//! drives transitions through this service and never touches the columns
//! directly.
//!
//! ## Rules
//!
//! 1. Plan, limits, status, and period fields move together in one UPDATE; a
//!    reader can never observe a plan without its matching limits.
//! 2. The transition history row lands in the same transaction as the UPDATE.
//! 3. Manual actions call the payment processor BEFORE any local write; a
//!    processor failure leaves local state untouched.
//! 4. Last-writer-wins across concurrent transitions is acceptable (each one
//!    restates the full target state); partial writes are not.

use std::sync::Arc;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use mailtide_shared::types::{PlanId, SubscriptionStatus, TransitionKind};

use crate::catalog::PlanCatalog;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::history::{HistoryService, TransitionRecord};
use crate::processor::ProcessorClient;

/// Column list shared by every query returning an organization row.
pub(crate) const ORG_COLUMNS: &str = r#"
    id, name, plan, status, billing_cycle, trial_ends_at, period_ends_at,
    cancel_at_period_end, is_active, processor_customer_ref,
    processor_subscription_ref, processor_price_ref, contacts_limit,
    campaigns_limit, emails_per_month_limit, pending_plan, pending_plan_at,
    created_at, updated_at
"#;

/// An organization row. Plan and status are stored as strings and parsed
/// leniently on read; unknown values degrade to the most restrictive
/// interpretation instead of failing open.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub plan: String,
    pub status: String,
    pub billing_cycle: String,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub period_ends_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub is_active: bool,
    pub processor_customer_ref: Option<String>,
    pub processor_subscription_ref: Option<String>,
    pub processor_price_ref: Option<String>,
    pub contacts_limit: i64,
    pub campaigns_limit: i64,
    pub emails_per_month_limit: i64,
    pub pending_plan: Option<String>,
    pub pending_plan_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Organization {
    /// Unknown plan strings read as the trial plan (smallest limits).
    pub fn plan_id(&self) -> PlanId {
        self.plan.parse().unwrap_or(PlanId::FreeTrial)
    }

    /// Unknown status strings read as canceled (no access).
    pub fn status_id(&self) -> SubscriptionStatus {
        self.status.parse().unwrap_or(SubscriptionStatus::Canceled)
    }

    /// The timestamp that decides expiry: the trial end while on the trial
    /// plan, the period end otherwise. Exactly one of them is authoritative.
    pub fn authoritative_expiry(&self) -> Option<OffsetDateTime> {
        if self.plan_id().is_trial() {
            self.trial_ends_at
        } else {
            self.period_ends_at
        }
    }
}

/// Field changes carried by a subscription-updated event. `new_plan` is set
/// only when the event's price resolved to a plan.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub new_plan: Option<PlanId>,
    pub price_ref: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub cancel_at_period_end: Option<bool>,
    pub period_end: Option<OffsetDateTime>,
}

/// Who asked for a manual plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanChangeSource {
    UserRequest,
    AdminPanel,
    System,
}

impl PlanChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanChangeSource::UserRequest => "user_request",
            PlanChangeSource::AdminPanel => "admin_panel",
            PlanChangeSource::System => "system",
        }
    }
}

impl std::fmt::Display for PlanChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options for a manual plan change. Timing is caller-supplied; there is
/// deliberately no default for `immediate`.
#[derive(Debug, Clone)]
pub struct ChangePlanOptions {
    pub immediate: bool,
    pub source: PlanChangeSource,
    pub reason: Option<String>,
}

impl ChangePlanOptions {
    pub fn immediate(source: PlanChangeSource) -> Self {
        Self {
            immediate: true,
            source,
            reason: None,
        }
    }

    pub fn at_period_end(source: PlanChangeSource) -> Self {
        Self {
            immediate: false,
            source,
            reason: None,
        }
    }
}

/// Outcome of a manual plan change.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanChangeResult {
    pub from_plan: String,
    pub to_plan: String,
    pub scheduled: bool,
    pub effective_at: Option<OffsetDateTime>,
    pub message: String,
}

/// Why an organization was expired by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryKind {
    /// Trial window lapsed; access revoked until the customer subscribes.
    Trial,
    /// Paid period lapsed with no pending cancellation (grace ran out).
    Subscription,
    /// Cancel-at-period-end came due; the org was reset to a fresh trial.
    CanceledReset,
}

/// Classify what expiring `org` at `now` should do. Returns `None` when the
/// organization is not actually past its authoritative expiry.
pub fn expiry_kind_for(org: &Organization, now: OffsetDateTime) -> Option<ExpiryKind> {
    let expiry = org.authoritative_expiry()?;
    if expiry > now {
        return None;
    }
    if org.status_id() == SubscriptionStatus::Canceled {
        return None;
    }
    if org.plan_id().is_trial() {
        Some(ExpiryKind::Trial)
    } else if org.cancel_at_period_end {
        Some(ExpiryKind::CanceledReset)
    } else {
        Some(ExpiryKind::Subscription)
    }
}

pub struct ExpiredOrg {
    pub org: Organization,
    pub kind: ExpiryKind,
}

/// The state machine service.
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    catalog: Arc<PlanCatalog>,
    config: BillingConfig,
    history: HistoryService,
    processor: ProcessorClient,
}

impl SubscriptionService {
    pub fn new(config: BillingConfig, catalog: Arc<PlanCatalog>, pool: PgPool) -> Self {
        let history = HistoryService::new(pool.clone());
        let processor = ProcessorClient::new(config.processor.clone());
        Self {
            pool,
            catalog,
            config,
            history,
            processor,
        }
    }

    pub fn history(&self) -> &HistoryService {
        &self.history
    }

    // =========================================================================
    // LOOKUPS
    // =========================================================================

    pub async fn get(&self, org_id: Uuid) -> BillingResult<Organization> {
        let org: Option<Organization> =
            sqlx::query_as(&format!("SELECT {ORG_COLUMNS} FROM organizations WHERE id = $1"))
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        org.ok_or_else(|| BillingError::UnresolvedTarget(format!("organization {}", org_id)))
    }

    pub async fn find_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<Organization>> {
        sqlx::query_as(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE processor_customer_ref = $1"
        ))
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))
    }

    pub async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Organization>> {
        sqlx::query_as(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE processor_subscription_ref = $1"
        ))
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))
    }

    // =========================================================================
    // SIGNUP
    // =========================================================================

    /// Create an organization in its initial state: trial plan, trialing
    /// status, trial window open, trial limits.
    pub async fn create_organization(&self, name: &str) -> BillingResult<Organization> {
        let trial = self.catalog.trial();
        let trial_ends_at =
            OffsetDateTime::now_utc() + Duration::days(self.config.trial_length_days);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let org: Organization = sqlx::query_as(&format!(
            r#"
            INSERT INTO organizations
                (name, plan, status, trial_ends_at,
                 contacts_limit, campaigns_limit, emails_per_month_limit)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {ORG_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(trial.id.as_str())
        .bind(SubscriptionStatus::Trialing.as_str())
        .bind(trial_ends_at)
        .bind(trial.contacts_limit)
        .bind(trial.campaigns_limit)
        .bind(trial.emails_per_month_limit)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        self.history
            .record_in_tx(
                &mut tx,
                TransitionRecord::new(org.id, TransitionKind::TrialStarted)
                    .plans("", trial.id.as_str())
                    .statuses("", SubscriptionStatus::Trialing.as_str())
                    .metadata(serde_json::json!({
                        "trial_ends_at": trial_ends_at.to_string(),
                    })),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org.id,
            trial_ends_at = %trial_ends_at,
            "Organization created with trial window"
        );
        Ok(org)
    }

    // =========================================================================
    // WEBHOOK-DRIVEN TRANSITIONS
    // =========================================================================

    /// trialing -> active: a checkout completed and the processor created the
    /// subscription. Stores the processor refs and the plan's limits.
    #[allow(clippy::too_many_arguments)]
    pub async fn activate_from_checkout(
        &self,
        org: &Organization,
        plan: PlanId,
        customer_ref: &str,
        subscription_ref: &str,
        price_ref: &str,
        period_end: Option<OffsetDateTime>,
        event_ref: &str,
    ) -> BillingResult<Organization> {
        let def = self.catalog.get_or_trial(plan);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let updated: Organization = sqlx::query_as(&format!(
            r#"
            UPDATE organizations SET
                plan = $1,
                status = $2,
                billing_cycle = $3,
                trial_ends_at = NULL,
                period_ends_at = $4,
                cancel_at_period_end = FALSE,
                is_active = TRUE,
                processor_customer_ref = $5,
                processor_subscription_ref = $6,
                processor_price_ref = $7,
                contacts_limit = $8,
                campaigns_limit = $9,
                emails_per_month_limit = $10,
                updated_at = NOW()
            WHERE id = $11
            RETURNING {ORG_COLUMNS}
            "#
        ))
        .bind(def.id.as_str())
        .bind(SubscriptionStatus::Active.as_str())
        .bind(def.id.billing_cycle().as_str())
        .bind(period_end)
        .bind(customer_ref)
        .bind(subscription_ref)
        .bind(price_ref)
        .bind(def.contacts_limit)
        .bind(def.campaigns_limit)
        .bind(def.emails_per_month_limit)
        .bind(org.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        self.history
            .record_in_tx(
                &mut tx,
                TransitionRecord::new(org.id, TransitionKind::Created)
                    .external_event(event_ref)
                    .plans(&org.plan, def.id.as_str())
                    .statuses(&org.status, SubscriptionStatus::Active.as_str())
                    .metadata(serde_json::json!({
                        "subscription_ref": subscription_ref,
                        "price_ref": price_ref,
                    })),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org.id,
            plan = %def.id,
            "Subscription activated from checkout"
        );
        Ok(updated)
    }

    /// Apply a subscription-updated event. Returns the updated row and
    /// whether the plan changed (callers notify only on plan changes).
    pub async fn apply_subscription_update(
        &self,
        org: &Organization,
        update: SubscriptionUpdate,
        event_ref: &str,
    ) -> BillingResult<(Organization, bool)> {
        let new_status = update.status.unwrap_or(org.status_id());
        let cancel_flag = update
            .cancel_at_period_end
            .unwrap_or(org.cancel_at_period_end);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let (updated, plan_changed) = match update.new_plan {
            Some(new_plan) if new_plan != org.plan_id() => {
                let def = self.catalog.get_or_trial(new_plan);
                let row: Organization = sqlx::query_as(&format!(
                    r#"
                    UPDATE organizations SET
                        plan = $1,
                        billing_cycle = $2,
                        status = $3,
                        cancel_at_period_end = $4,
                        period_ends_at = COALESCE($5, period_ends_at),
                        processor_price_ref = COALESCE($6, processor_price_ref),
                        contacts_limit = $7,
                        campaigns_limit = $8,
                        emails_per_month_limit = $9,
                        is_active = TRUE,
                        updated_at = NOW()
                    WHERE id = $10
                    RETURNING {ORG_COLUMNS}
                    "#
                ))
                .bind(def.id.as_str())
                .bind(def.id.billing_cycle().as_str())
                .bind(new_status.as_str())
                .bind(cancel_flag)
                .bind(update.period_end)
                .bind(&update.price_ref)
                .bind(def.contacts_limit)
                .bind(def.campaigns_limit)
                .bind(def.emails_per_month_limit)
                .bind(org.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;

                self.history
                    .record_in_tx(
                        &mut tx,
                        TransitionRecord::new(org.id, TransitionKind::PlanChanged)
                            .external_event(event_ref)
                            .plans(&org.plan, def.id.as_str())
                            .statuses(&org.status, new_status.as_str())
                            .metadata(serde_json::json!({
                                "source": "processor_webhook",
                            })),
                    )
                    .await?;
                (row, true)
            }
            _ => {
                let row: Organization = sqlx::query_as(&format!(
                    r#"
                    UPDATE organizations SET
                        status = $1,
                        cancel_at_period_end = $2,
                        period_ends_at = COALESCE($3, period_ends_at),
                        updated_at = NOW()
                    WHERE id = $4
                    RETURNING {ORG_COLUMNS}
                    "#
                ))
                .bind(new_status.as_str())
                .bind(cancel_flag)
                .bind(update.period_end)
                .bind(org.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;

                self.history
                    .record_in_tx(
                        &mut tx,
                        TransitionRecord::new(org.id, TransitionKind::Updated)
                            .external_event(event_ref)
                            .statuses(&org.status, new_status.as_str())
                            .metadata(serde_json::json!({
                                "cancel_at_period_end": cancel_flag,
                            })),
                    )
                    .await?;
                (row, false)
            }
        };

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org.id,
            status = %new_status,
            plan_changed = plan_changed,
            "Subscription update applied"
        );
        Ok((updated, plan_changed))
    }

    /// Subscription deleted at the processor: the customer drops back to a
    /// fresh trial window at trial limits, so they can still explore at
    /// reduced capacity instead of being locked out entirely.
    pub async fn apply_subscription_deleted(
        &self,
        org: &Organization,
        event_ref: &str,
    ) -> BillingResult<Organization> {
        let trial = self.catalog.trial();
        let trial_ends_at =
            OffsetDateTime::now_utc() + Duration::days(self.config.trial_length_days);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let updated: Organization = sqlx::query_as(&format!(
            r#"
            UPDATE organizations SET
                plan = $1,
                status = $2,
                billing_cycle = 'monthly',
                trial_ends_at = $3,
                period_ends_at = NULL,
                cancel_at_period_end = FALSE,
                is_active = TRUE,
                processor_subscription_ref = NULL,
                processor_price_ref = NULL,
                pending_plan = NULL,
                pending_plan_at = NULL,
                contacts_limit = $4,
                campaigns_limit = $5,
                emails_per_month_limit = $6,
                updated_at = NOW()
            WHERE id = $7
            RETURNING {ORG_COLUMNS}
            "#
        ))
        .bind(trial.id.as_str())
        .bind(SubscriptionStatus::Trialing.as_str())
        .bind(trial_ends_at)
        .bind(trial.contacts_limit)
        .bind(trial.campaigns_limit)
        .bind(trial.emails_per_month_limit)
        .bind(org.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        self.history
            .record_in_tx(
                &mut tx,
                TransitionRecord::new(org.id, TransitionKind::Canceled)
                    .external_event(event_ref)
                    .plans(&org.plan, trial.id.as_str())
                    .statuses(&org.status, SubscriptionStatus::Trialing.as_str())
                    .metadata(serde_json::json!({
                        "reset_to_trial": true,
                        "trial_ends_at": trial_ends_at.to_string(),
                    })),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org.id,
            "Subscription deleted, organization reset to trial"
        );
        Ok(updated)
    }

    /// Payment cleared. Recovers past_due organizations and refreshes the
    /// period end when the invoice carries one.
    pub async fn apply_payment_succeeded(
        &self,
        org: &Organization,
        amount_cents: Option<i64>,
        invoice_ref: Option<&str>,
        period_end: Option<OffsetDateTime>,
        event_ref: &str,
    ) -> BillingResult<Organization> {
        let was_past_due = org.status_id() == SubscriptionStatus::PastDue;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let updated: Organization = sqlx::query_as(&format!(
            r#"
            UPDATE organizations SET
                status = $1,
                is_active = TRUE,
                period_ends_at = COALESCE($2, period_ends_at),
                updated_at = NOW()
            WHERE id = $3
            RETURNING {ORG_COLUMNS}
            "#
        ))
        .bind(SubscriptionStatus::Active.as_str())
        .bind(period_end)
        .bind(org.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        // A recovery from past_due reads differently in the audit trail than
        // a routine renewal.
        let kind = if was_past_due {
            TransitionKind::PaymentSucceeded
        } else {
            TransitionKind::Renewed
        };
        let mut record = TransitionRecord::new(org.id, kind)
            .external_event(event_ref)
            .statuses(&org.status, SubscriptionStatus::Active.as_str())
            .metadata(serde_json::json!({ "recovered": was_past_due }));
        if let Some(cents) = amount_cents {
            record = record.amount_cents(cents);
        }
        if let Some(invoice) = invoice_ref {
            record = record.invoice_ref(invoice);
        }
        self.history.record_in_tx(&mut tx, record).await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org.id,
            recovered = was_past_due,
            "Payment succeeded, organization active"
        );
        Ok(updated)
    }

    /// Payment failed: soft-fail into past_due. Access continues through a
    /// grace window instead of cutting a paying customer off for one bounced
    /// charge; the sweep revokes access only after the window lapses.
    pub async fn apply_payment_failed(
        &self,
        org: &Organization,
        amount_cents: Option<i64>,
        invoice_ref: Option<&str>,
        failure_reason: Option<&str>,
        event_ref: &str,
    ) -> BillingResult<Organization> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        // Keep a period end that is still in the future; only a lapsed or
        // missing one is replaced by the grace window.
        let updated: Organization = sqlx::query_as(&format!(
            r#"
            UPDATE organizations SET
                status = $1,
                period_ends_at = CASE
                    WHEN period_ends_at IS NULL OR period_ends_at <= NOW()
                    THEN NOW() + make_interval(days => $2::int)
                    ELSE period_ends_at
                END,
                updated_at = NOW()
            WHERE id = $3
            RETURNING {ORG_COLUMNS}
            "#
        ))
        .bind(SubscriptionStatus::PastDue.as_str())
        .bind(self.config.grace_period_days as i32)
        .bind(org.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let mut record = TransitionRecord::new(org.id, TransitionKind::PaymentFailed)
            .external_event(event_ref)
            .statuses(&org.status, SubscriptionStatus::PastDue.as_str())
            .metadata(serde_json::json!({
                "grace_period_days": self.config.grace_period_days,
            }));
        if let Some(cents) = amount_cents {
            record = record.amount_cents(cents);
        }
        if let Some(invoice) = invoice_ref {
            record = record.invoice_ref(invoice);
        }
        if let Some(reason) = failure_reason {
            record = record.failure_reason(reason);
        }
        self.history.record_in_tx(&mut tx, record).await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::warn!(
            org_id = %org.id,
            grace_days = self.config.grace_period_days,
            "Payment failed, organization past_due"
        );
        Ok(updated)
    }

    // =========================================================================
    // MANUAL MANAGEMENT ACTIONS
    // =========================================================================

    /// Manual upgrade/downgrade. The processor is updated first; only then is
    /// local state written. Immediate changes apply plan+limits now;
    /// at-period-end changes are recorded as pending and applied by the sweep
    /// when the period closes, so this month's usage is judged under the old
    /// limits until then.
    pub async fn change_plan(
        &self,
        org_id: Uuid,
        new_plan: PlanId,
        options: ChangePlanOptions,
    ) -> BillingResult<PlanChangeResult> {
        let def = self
            .catalog
            .get(new_plan)
            .ok_or_else(|| BillingError::UnknownPlanReference(new_plan.to_string()))?;
        if new_plan.is_trial() {
            return Err(BillingError::InvalidInput(
                "cannot switch to the trial plan; cancel instead".to_string(),
            ));
        }

        let org = self.get(org_id).await?;
        if org.plan_id() == new_plan {
            return Err(BillingError::InvalidInput(format!(
                "organization already on plan {}",
                new_plan
            )));
        }

        let is_downgrade = PlanCatalog::is_downgrade(org.plan_id(), new_plan);
        tracing::info!(
            org_id = %org_id,
            from_plan = %org.plan,
            to_plan = %new_plan,
            immediate = options.immediate,
            is_downgrade = is_downgrade,
            source = %options.source,
            "Starting plan change"
        );

        // Remote first: a processor failure must leave local state untouched.
        if let (Some(sub_ref), Some(price_ref)) = (
            org.processor_subscription_ref.as_deref(),
            self.catalog.price_ref_for(new_plan),
        ) {
            self.processor
                .update_subscription_price(sub_ref, price_ref, options.immediate)
                .await?;
        }

        if options.immediate {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;

            sqlx::query(
                r#"
                UPDATE organizations SET
                    plan = $1,
                    billing_cycle = $2,
                    processor_price_ref = COALESCE($3, processor_price_ref),
                    contacts_limit = $4,
                    campaigns_limit = $5,
                    emails_per_month_limit = $6,
                    pending_plan = NULL,
                    pending_plan_at = NULL,
                    updated_at = NOW()
                WHERE id = $7
                "#,
            )
            .bind(def.id.as_str())
            .bind(def.id.billing_cycle().as_str())
            .bind(self.catalog.price_ref_for(new_plan))
            .bind(def.contacts_limit)
            .bind(def.campaigns_limit)
            .bind(def.emails_per_month_limit)
            .bind(org_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            self.history
                .record_in_tx(
                    &mut tx,
                    TransitionRecord::new(org_id, TransitionKind::PlanChanged)
                        .plans(&org.plan, def.id.as_str())
                        .metadata(serde_json::json!({
                            "immediate": true,
                            "is_downgrade": is_downgrade,
                            "source": options.source.as_str(),
                            "reason": options.reason,
                        })),
                )
                .await?;

            tx.commit()
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;

            tracing::info!(
                org_id = %org_id,
                from_plan = %org.plan,
                to_plan = %new_plan,
                "Plan changed immediately"
            );
            return Ok(PlanChangeResult {
                from_plan: org.plan.clone(),
                to_plan: new_plan.to_string(),
                scheduled: false,
                effective_at: None,
                message: format!("Plan changed from {} to {}", org.plan, new_plan),
            });
        }

        // Scheduled at period end. Overwriting an existing pending change is
        // allowed but worth a warning in the logs.
        if let Some(existing) = &org.pending_plan {
            if existing != new_plan.as_str() {
                tracing::warn!(
                    org_id = %org_id,
                    existing_pending = %existing,
                    new_pending = %new_plan,
                    "Replacing previously scheduled plan change"
                );
            }
        }

        let effective_at = org.period_ends_at.unwrap_or_else(OffsetDateTime::now_utc);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE organizations SET
                pending_plan = $1,
                pending_plan_at = $2,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(def.id.as_str())
        .bind(effective_at)
        .bind(org_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        self.history
            .record_in_tx(
                &mut tx,
                TransitionRecord::new(org_id, TransitionKind::Updated).metadata(
                    serde_json::json!({
                        "action": "plan_change_scheduled",
                        "to_plan": def.id.as_str(),
                        "effective_at": effective_at.to_string(),
                        "is_downgrade": is_downgrade,
                        "source": options.source.as_str(),
                    }),
                ),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org_id,
            to_plan = %new_plan,
            effective_at = %effective_at,
            "Plan change scheduled at period end"
        );
        Ok(PlanChangeResult {
            from_plan: org.plan.clone(),
            to_plan: new_plan.to_string(),
            scheduled: true,
            effective_at: Some(effective_at),
            message: format!("Change to {} scheduled for {}", new_plan, effective_at),
        })
    }

    /// Cancel the subscription. Immediate cancellation revokes access now;
    /// otherwise the cancel flag is set and the sweep (or the deletion
    /// webhook) finishes the job when the period closes.
    pub async fn cancel(&self, org_id: Uuid, immediate: bool) -> BillingResult<Organization> {
        let org = self.get(org_id).await?;
        let sub_ref = org.processor_subscription_ref.as_deref().ok_or_else(|| {
            BillingError::InvalidInput("no active subscription to cancel".to_string())
        })?;

        self.processor
            .cancel_subscription(sub_ref, !immediate)
            .await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let updated: Organization = if immediate {
            sqlx::query_as(&format!(
                r#"
                UPDATE organizations SET
                    status = $1,
                    is_active = FALSE,
                    period_ends_at = NOW(),
                    cancel_at_period_end = FALSE,
                    updated_at = NOW()
                WHERE id = $2
                RETURNING {ORG_COLUMNS}
                "#
            ))
            .bind(SubscriptionStatus::Canceled.as_str())
            .bind(org_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?
        } else {
            sqlx::query_as(&format!(
                r#"
                UPDATE organizations SET
                    cancel_at_period_end = TRUE,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING {ORG_COLUMNS}
                "#
            ))
            .bind(org_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?
        };

        self.history
            .record_in_tx(
                &mut tx,
                TransitionRecord::new(org_id, TransitionKind::Canceled)
                    .statuses(&org.status, &updated.status)
                    .metadata(serde_json::json!({
                        "immediate": immediate,
                        "at_period_end": !immediate,
                    })),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org_id,
            immediate = immediate,
            "Subscription cancellation applied"
        );
        Ok(updated)
    }

    /// Undo a pending at-period-end cancellation.
    pub async fn resume(&self, org_id: Uuid) -> BillingResult<Organization> {
        let org = self.get(org_id).await?;
        if !org.cancel_at_period_end {
            return Err(BillingError::InvalidInput(
                "no pending cancellation to resume from".to_string(),
            ));
        }
        let sub_ref = org.processor_subscription_ref.as_deref().ok_or_else(|| {
            BillingError::InvalidInput("no subscription reference on organization".to_string())
        })?;

        self.processor.resume_subscription(sub_ref).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let updated: Organization = sqlx::query_as(&format!(
            r#"
            UPDATE organizations SET
                cancel_at_period_end = FALSE,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ORG_COLUMNS}
            "#
        ))
        .bind(org_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        self.history
            .record_in_tx(
                &mut tx,
                TransitionRecord::new(org_id, TransitionKind::Updated)
                    .metadata(serde_json::json!({ "action": "resume" })),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(org_id = %org_id, "Pending cancellation cleared");
        Ok(updated)
    }

    // =========================================================================
    // SWEEP-DRIVEN TRANSITIONS
    // =========================================================================

    /// Expire an organization whose authoritative end date has passed.
    /// Idempotent: re-running on an already-expired org is a no-op because
    /// `expiry_kind_for` returns `None` once the status is canceled or the
    /// trial has been reset.
    pub async fn expire(&self, org: &Organization) -> BillingResult<Option<ExpiredOrg>> {
        let now = OffsetDateTime::now_utc();
        let Some(kind) = expiry_kind_for(org, now) else {
            return Ok(None);
        };

        let updated = match kind {
            ExpiryKind::CanceledReset => {
                // Cancel-at-period-end came due: same reset as a processor
                // deletion event. The ref is salted with the timestamp so a
                // later re-cancellation can record its own transition.
                let event_ref = format!("sweep_reset_{}_{}", org.id, now.unix_timestamp());
                self.apply_subscription_deleted(org, &event_ref).await?
            }
            ExpiryKind::Trial | ExpiryKind::Subscription => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| BillingError::Database(e.to_string()))?;

                // Guarded update: a concurrent cancel or webhook may have
                // gotten there first, in which case there is nothing to do.
                let row: Option<Organization> = sqlx::query_as(&format!(
                    r#"
                    UPDATE organizations SET
                        status = $1,
                        is_active = FALSE,
                        updated_at = NOW()
                    WHERE id = $2 AND status <> $1
                    RETURNING {ORG_COLUMNS}
                    "#
                ))
                .bind(SubscriptionStatus::Canceled.as_str())
                .bind(org.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
                let Some(row) = row else {
                    return Ok(None);
                };

                let record_kind = match kind {
                    ExpiryKind::Trial => TransitionKind::TrialEnded,
                    _ => TransitionKind::Canceled,
                };
                self.history
                    .record_in_tx(
                        &mut tx,
                        TransitionRecord::new(org.id, record_kind)
                            .statuses(&org.status, SubscriptionStatus::Canceled.as_str())
                            .metadata(serde_json::json!({ "expired_by_sweep": true })),
                    )
                    .await?;

                tx.commit()
                    .await
                    .map_err(|e| BillingError::Database(e.to_string()))?;
                row
            }
        };

        tracing::info!(
            org_id = %org.id,
            kind = ?kind,
            "Organization expired by sweep"
        );
        Ok(Some(ExpiredOrg { org: updated, kind }))
    }

    /// Apply a scheduled at-period-end plan change that has come due.
    pub async fn apply_pending_plan(&self, org: &Organization) -> BillingResult<Organization> {
        let pending = org
            .pending_plan
            .as_deref()
            .ok_or_else(|| BillingError::InvalidInput("no pending plan".to_string()))?;

        let Ok(plan) = pending.parse::<PlanId>() else {
            // Bad data; clear it rather than retrying forever.
            tracing::error!(
                org_id = %org.id,
                pending = %pending,
                "Unparseable pending plan, clearing"
            );
            sqlx::query(
                "UPDATE organizations SET pending_plan = NULL, pending_plan_at = NULL WHERE id = $1",
            )
            .bind(org.id)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
            return Err(BillingError::UnknownPlanReference(pending.to_string()));
        };
        let def = self.catalog.get_or_trial(plan);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let updated: Organization = sqlx::query_as(&format!(
            r#"
            UPDATE organizations SET
                plan = $1,
                billing_cycle = $2,
                processor_price_ref = COALESCE($3, processor_price_ref),
                contacts_limit = $4,
                campaigns_limit = $5,
                emails_per_month_limit = $6,
                pending_plan = NULL,
                pending_plan_at = NULL,
                updated_at = NOW()
            WHERE id = $7
            RETURNING {ORG_COLUMNS}
            "#
        ))
        .bind(def.id.as_str())
        .bind(def.id.billing_cycle().as_str())
        .bind(self.catalog.price_ref_for(plan))
        .bind(def.contacts_limit)
        .bind(def.campaigns_limit)
        .bind(def.emails_per_month_limit)
        .bind(org.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        self.history
            .record_in_tx(
                &mut tx,
                TransitionRecord::new(org.id, TransitionKind::PlanChanged)
                    .plans(&org.plan, def.id.as_str())
                    .metadata(serde_json::json!({ "scheduled": true })),
            )
            .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org.id,
            from_plan = %org.plan,
            to_plan = %def.id,
            "Scheduled plan change applied"
        );
        Ok(updated)
    }
}
