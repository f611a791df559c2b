//! Payment Processor Webhook Handling
//!
//! Entry point for every billing event delivered by the payment processor.
//! The pipeline is strict about ordering:
//!
//! 1. Verify the HMAC signature. The body is never parsed before this step.
//! 2. Parse the envelope and claim the event in the idempotency ledger.
//! 3. Dispatch to the matching state-machine transition.
//! 4. Mark the ledger row processed (or failed, so a redelivery can retry).
//!
//! Signature failures and malformed envelopes surface as errors for the HTTP
//! layer to reject. Events that verify but cannot be acted on (unknown
//! organization, unknown price) are acknowledged and logged; retrying those
//! can never succeed.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use mailtide_shared::types::{NotificationKind, SubscriptionStatus};

use crate::catalog::PlanCatalog;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::notify::NotificationService;
use crate::subscriptions::{Organization, SubscriptionService, SubscriptionUpdate};

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// SIGNATURE VERIFICATION
// =============================================================================

/// Compute the hex signature for a timestamped payload. The signed message is
/// `"<timestamp>.<payload>"`; a `whsec_` prefix on the secret (the form the
/// processor dashboard hands out) is not part of the key. Exposed so tests
/// and local tooling can build valid headers.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::SignatureRejected("invalid secret key".to_string())
    })?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header of the form `t=<unix>,v1=<hex>` against the raw
/// payload. Multiple `v1` entries are accepted (the processor sends several
/// during secret rotation); any match passes. Comparison is constant-time.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => timestamp = v.parse().ok(),
            (Some("v1"), Some(v)) => candidates.push(v),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| BillingError::SignatureRejected("missing timestamp".to_string()))?;
    if candidates.is_empty() {
        return Err(BillingError::SignatureRejected(
            "missing v1 signature".to_string(),
        ));
    }

    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(BillingError::SignatureRejected(format!(
            "timestamp outside tolerance ({}s)",
            (now_unix - timestamp).abs()
        )));
    }

    let expected = compute_signature(secret, timestamp, payload)?;
    for candidate in candidates {
        if bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())) {
            return Ok(());
        }
    }
    Err(BillingError::SignatureRejected(
        "signature mismatch".to_string(),
    ))
}

// =============================================================================
// EVENT TAXONOMY
// =============================================================================

/// The closed set of event types this system acts on. Everything else maps to
/// `Unrecognized`, which is acknowledged and recorded but triggers nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PaymentSucceeded,
    PaymentFailed,
    TrialWillEnd,
    Unrecognized,
}

impl WebhookEventKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => WebhookEventKind::SubscriptionCreated,
            "customer.subscription.updated" => WebhookEventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => WebhookEventKind::SubscriptionDeleted,
            "invoice.payment_succeeded" => WebhookEventKind::PaymentSucceeded,
            "invoice.payment_failed" => WebhookEventKind::PaymentFailed,
            "customer.subscription.trial_will_end" => WebhookEventKind::TrialWillEnd,
            _ => WebhookEventKind::Unrecognized,
        }
    }
}

/// What happened to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// A state transition was applied.
    Processed,
    /// Another delivery of the same event already holds or finished the claim.
    Duplicate,
    /// Verified and recorded, but nothing to do (unrecognized type or
    /// unresolvable target).
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

/// Map the processor's subscription status vocabulary onto ours. Statuses we
/// have no local meaning for return `None` and leave the stored status alone.
pub fn map_processor_status(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "active" => Some(SubscriptionStatus::Active),
        "trialing" => Some(SubscriptionStatus::Trialing),
        "past_due" => Some(SubscriptionStatus::PastDue),
        "canceled" | "unpaid" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
        _ => None,
    }
}

// =============================================================================
// ENVELOPE FIELD EXTRACTION
// =============================================================================

fn str_field<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

/// A reference field is either a bare id string or an expanded object with an
/// `id`. Both forms appear depending on the processor's expansion settings.
fn ref_field<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    match object.get(key)? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn unix_ts_field(object: &Value, key: &str) -> Option<OffsetDateTime> {
    object
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
}

/// Price reference of the first subscription item, falling back to the legacy
/// top-level `plan` field older API versions still send.
fn price_ref_of(object: &Value) -> Option<&str> {
    object
        .pointer("/items/data/0/price/id")
        .and_then(Value::as_str)
        .or_else(|| object.pointer("/plan/id").and_then(Value::as_str))
}

// =============================================================================
// IDEMPOTENCY LEDGER
// =============================================================================

/// Claim an event for processing. The upsert takes the claim when the event
/// is new, previously failed, or stuck in `processing` longer than the
/// recovery window (a crashed worker). A finished or freshly in-flight claim
/// returns no row.
const CLAIM_EVENT: &str = r#"
    INSERT INTO processed_webhook_events (event_ref, event_type, status, processing_started_at)
    VALUES ($1, $2, 'processing', NOW())
    ON CONFLICT (event_ref) DO UPDATE SET
        status = 'processing',
        processing_started_at = NOW(),
        error_message = NULL
    WHERE processed_webhook_events.status IN ('pending', 'failed')
       OR (processed_webhook_events.status = 'processing'
           AND processed_webhook_events.processing_started_at
               < NOW() - make_interval(mins => $3::int))
    RETURNING id
"#;

// =============================================================================
// SERVICE
// =============================================================================

/// Webhook ingestion service.
#[derive(Clone)]
pub struct WebhookService {
    pool: PgPool,
    config: BillingConfig,
    catalog: Arc<PlanCatalog>,
    subscriptions: SubscriptionService,
    notifications: NotificationService,
}

impl WebhookService {
    pub fn new(config: BillingConfig, catalog: Arc<PlanCatalog>, pool: PgPool) -> Self {
        let subscriptions = SubscriptionService::new(config.clone(), catalog.clone(), pool.clone());
        let notifications =
            NotificationService::new(pool.clone(), config.notification_callback_url.clone());
        Self {
            pool,
            config,
            catalog,
            subscriptions,
            notifications,
        }
    }

    /// Full ingestion pipeline for one delivery. `payload` is the raw request
    /// body exactly as received; any re-serialization would break the
    /// signature.
    pub async fn handle(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookOutcome> {
        verify_signature(
            &self.config.webhook_secret,
            signature_header,
            payload,
            OffsetDateTime::now_utc().unix_timestamp(),
            self.config.signature_tolerance_secs,
        )?;

        let envelope: Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::MalformedPayload(format!("invalid JSON: {}", e)))?;
        let event_ref = str_field(&envelope, "id")
            .ok_or_else(|| BillingError::MalformedPayload("missing event id".to_string()))?
            .to_string();
        let event_type = str_field(&envelope, "type").unwrap_or("").to_string();
        let kind = WebhookEventKind::from_event_type(&event_type);

        if !self.claim_event(&event_ref, &event_type).await? {
            tracing::info!(event_ref = %event_ref, "Duplicate webhook delivery skipped");
            return Ok(WebhookOutcome::Duplicate);
        }

        if kind == WebhookEventKind::Unrecognized {
            tracing::debug!(
                event_ref = %event_ref,
                event_type = %event_type,
                "Unrecognized webhook event type, acknowledged"
            );
            self.mark_processed(&event_ref).await?;
            return Ok(WebhookOutcome::Ignored);
        }

        let object = envelope
            .pointer("/data/object")
            .cloned()
            .unwrap_or(Value::Null);

        tracing::info!(
            event_ref = %event_ref,
            event_type = %event_type,
            "Processing webhook event"
        );

        match self.dispatch(kind, &object, &event_ref).await {
            Ok(()) => {
                self.mark_processed(&event_ref).await?;
                Ok(WebhookOutcome::Processed)
            }
            // Permanent failures: redelivering the same payload cannot
            // succeed, so acknowledge instead of inviting retries.
            Err(
                e @ (BillingError::UnresolvedTarget(_)
                | BillingError::UnknownPlanReference(_)
                | BillingError::MalformedPayload(_)),
            ) => {
                tracing::warn!(
                    event_ref = %event_ref,
                    error = %e,
                    "Webhook event unactionable, acknowledged without transition"
                );
                self.mark_processed(&event_ref).await?;
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => {
                self.mark_failed(&event_ref, &e).await;
                Err(e)
            }
        }
    }

    async fn claim_event(&self, event_ref: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(CLAIM_EVENT)
            .bind(event_ref)
            .bind(event_type)
            .bind(self.config.event_recovery_minutes as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(claimed.is_some())
    }

    async fn mark_processed(&self, event_ref: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET status = 'processed', processed_at = NOW()
            WHERE event_ref = $1
            "#,
        )
        .bind(event_ref)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    /// Best-effort: the original error is what the caller needs to see, even
    /// if this bookkeeping write also fails.
    async fn mark_failed(&self, event_ref: &str, error: &BillingError) {
        let result = sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET status = 'failed', error_message = $2
            WHERE event_ref = $1
            "#,
        )
        .bind(event_ref)
        .bind(error.to_string())
        .execute(&self.pool)
        .await;
        if let Err(db_err) = result {
            tracing::error!(
                event_ref = %event_ref,
                error = %db_err,
                "Failed to mark webhook event as failed"
            );
        }
    }

    async fn dispatch(
        &self,
        kind: WebhookEventKind,
        object: &Value,
        event_ref: &str,
    ) -> BillingResult<()> {
        match kind {
            WebhookEventKind::SubscriptionCreated => {
                self.handle_subscription_created(object, event_ref).await
            }
            WebhookEventKind::SubscriptionUpdated => {
                self.handle_subscription_updated(object, event_ref).await
            }
            WebhookEventKind::SubscriptionDeleted => {
                self.handle_subscription_deleted(object, event_ref).await
            }
            WebhookEventKind::PaymentSucceeded => {
                self.handle_payment_succeeded(object, event_ref).await
            }
            WebhookEventKind::PaymentFailed => self.handle_payment_failed(object, event_ref).await,
            WebhookEventKind::TrialWillEnd => self.handle_trial_will_end(object, event_ref).await,
            WebhookEventKind::Unrecognized => Ok(()),
        }
    }

    /// Resolve the organization an event refers to. Tries the subscription
    /// reference, then the customer reference, then an `organization_id` the
    /// checkout flow planted in the subscription metadata (the only link
    /// available on the very first event, before refs are stored).
    async fn resolve_org(
        &self,
        subscription_ref: Option<&str>,
        customer_ref: Option<&str>,
        org_hint: Option<&str>,
    ) -> BillingResult<Organization> {
        if let Some(sub) = subscription_ref {
            if let Some(org) = self.subscriptions.find_by_subscription_ref(sub).await? {
                return Ok(org);
            }
        }
        if let Some(cus) = customer_ref {
            if let Some(org) = self.subscriptions.find_by_customer_ref(cus).await? {
                return Ok(org);
            }
        }
        if let Some(hint) = org_hint {
            if let Ok(org_id) = hint.parse::<Uuid>() {
                return self.subscriptions.get(org_id).await;
            }
        }
        Err(BillingError::UnresolvedTarget(format!(
            "no organization for subscription={:?} customer={:?}",
            subscription_ref, customer_ref
        )))
    }

    async fn handle_subscription_created(
        &self,
        object: &Value,
        event_ref: &str,
    ) -> BillingResult<()> {
        let sub_ref = str_field(object, "id")
            .ok_or_else(|| BillingError::MalformedPayload("subscription id missing".to_string()))?;
        let customer_ref = ref_field(object, "customer")
            .ok_or_else(|| BillingError::MalformedPayload("customer ref missing".to_string()))?;
        let price_ref = price_ref_of(object)
            .ok_or_else(|| BillingError::MalformedPayload("price ref missing".to_string()))?;
        let org_hint = object
            .pointer("/metadata/organization_id")
            .and_then(Value::as_str);

        let org = self
            .resolve_org(Some(sub_ref), Some(customer_ref), org_hint)
            .await?;
        let plan = self
            .catalog
            .resolve_price(price_ref)
            .ok_or_else(|| BillingError::UnknownPlanReference(price_ref.to_string()))?;
        let period_end = unix_ts_field(object, "current_period_end");

        let updated = self
            .subscriptions
            .activate_from_checkout(
                &org,
                plan,
                customer_ref,
                sub_ref,
                price_ref,
                period_end,
                event_ref,
            )
            .await?;

        if let Err(e) = self
            .notifications
            .notify(
                org.id,
                NotificationKind::SubscriptionActivated,
                serde_json::json!({ "plan": updated.plan }),
            )
            .await
        {
            tracing::warn!(error = %e, org_id = %org.id, "Failed to dispatch activation notification");
        }
        Ok(())
    }

    async fn handle_subscription_updated(
        &self,
        object: &Value,
        event_ref: &str,
    ) -> BillingResult<()> {
        let sub_ref = str_field(object, "id");
        let customer_ref = ref_field(object, "customer");
        let org_hint = object
            .pointer("/metadata/organization_id")
            .and_then(Value::as_str);
        let org = self.resolve_org(sub_ref, customer_ref, org_hint).await?;

        let price_ref = price_ref_of(object);
        let new_plan = price_ref.and_then(|p| self.catalog.resolve_price(p));
        if let (Some(p), None) = (price_ref, new_plan) {
            tracing::warn!(
                price_ref = %p,
                org_id = %org.id,
                "Update carries unknown price reference, plan left unchanged"
            );
        }

        let update = SubscriptionUpdate {
            new_plan,
            price_ref: price_ref.map(str::to_string),
            status: str_field(object, "status").and_then(map_processor_status),
            cancel_at_period_end: object.get("cancel_at_period_end").and_then(Value::as_bool),
            period_end: unix_ts_field(object, "current_period_end"),
        };

        let (updated, plan_changed) = self
            .subscriptions
            .apply_subscription_update(&org, update, event_ref)
            .await?;

        if plan_changed {
            if let Err(e) = self
                .notifications
                .notify(
                    org.id,
                    NotificationKind::PlanChanged,
                    serde_json::json!({ "from": org.plan, "to": updated.plan }),
                )
                .await
            {
                tracing::warn!(error = %e, org_id = %org.id, "Failed to dispatch plan change notification");
            }
        }
        Ok(())
    }

    async fn handle_subscription_deleted(
        &self,
        object: &Value,
        event_ref: &str,
    ) -> BillingResult<()> {
        let sub_ref = str_field(object, "id");
        let customer_ref = ref_field(object, "customer");
        let org = self.resolve_org(sub_ref, customer_ref, None).await?;

        self.subscriptions
            .apply_subscription_deleted(&org, event_ref)
            .await?;

        if let Err(e) = self
            .notifications
            .notify(
                org.id,
                NotificationKind::SubscriptionCanceled,
                serde_json::json!({ "previous_plan": org.plan, "reset_to_trial": true }),
            )
            .await
        {
            tracing::warn!(error = %e, org_id = %org.id, "Failed to dispatch cancellation notification");
        }
        Ok(())
    }

    async fn handle_payment_succeeded(
        &self,
        object: &Value,
        event_ref: &str,
    ) -> BillingResult<()> {
        let customer_ref = ref_field(object, "customer");
        let sub_ref = ref_field(object, "subscription");
        let org = self.resolve_org(sub_ref, customer_ref, None).await?;

        let amount_cents = object.get("amount_paid").and_then(Value::as_i64);
        let invoice_ref = str_field(object, "id");
        let period_end = unix_ts_field(object, "period_end");
        let recovered = org.status_id() == SubscriptionStatus::PastDue;

        self.subscriptions
            .apply_payment_succeeded(&org, amount_cents, invoice_ref, period_end, event_ref)
            .await?;

        if let Err(e) = self
            .notifications
            .notify(
                org.id,
                NotificationKind::PaymentSucceeded,
                serde_json::json!({
                    "amount_cents": amount_cents,
                    "invoice_ref": invoice_ref,
                    "recovered": recovered,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, org_id = %org.id, "Failed to dispatch payment receipt notification");
        }
        Ok(())
    }

    async fn handle_payment_failed(&self, object: &Value, event_ref: &str) -> BillingResult<()> {
        let customer_ref = ref_field(object, "customer");
        let sub_ref = ref_field(object, "subscription");
        let org = self.resolve_org(sub_ref, customer_ref, None).await?;

        let amount_cents = object.get("amount_due").and_then(Value::as_i64);
        let invoice_ref = str_field(object, "id");
        let failure_reason = object
            .pointer("/last_finalization_error/message")
            .and_then(Value::as_str);
        let attempt_count = object.get("attempt_count").and_then(Value::as_i64);

        self.subscriptions
            .apply_payment_failed(&org, amount_cents, invoice_ref, failure_reason, event_ref)
            .await?;

        if let Err(e) = self
            .notifications
            .notify(
                org.id,
                NotificationKind::PaymentFailed,
                serde_json::json!({
                    "amount_cents": amount_cents,
                    "invoice_ref": invoice_ref,
                    "attempt_count": attempt_count,
                    "grace_period_days": self.config.grace_period_days,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, org_id = %org.id, "Failed to dispatch payment failure notification");
        }
        Ok(())
    }

    /// No state change; purely a heads-up to the customer. The processor
    /// sends this a few days before a trialing subscription converts.
    async fn handle_trial_will_end(&self, object: &Value, _event_ref: &str) -> BillingResult<()> {
        let sub_ref = str_field(object, "id");
        let customer_ref = ref_field(object, "customer");
        let org_hint = object
            .pointer("/metadata/organization_id")
            .and_then(Value::as_str);
        let org = self.resolve_org(sub_ref, customer_ref, org_hint).await?;

        let trial_end = unix_ts_field(object, "trial_end");
        let days_remaining = trial_end
            .map(|end| (end - OffsetDateTime::now_utc()).whole_days().max(0))
            .unwrap_or(0);

        if let Err(e) = self
            .notifications
            .notify(
                org.id,
                NotificationKind::TrialEndingSoon,
                serde_json::json!({
                    "days_remaining": days_remaining,
                    "trial_ends_at": trial_end.map(|t| t.to_string()),
                }),
            )
            .await
        {
            tracing::warn!(error = %e, org_id = %org.id, "Failed to dispatch trial reminder notification");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret_key";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"invoice.payment_succeeded"}"#;

    fn signed_header(timestamp: i64, payload: &str) -> String {
        let sig = compute_signature(SECRET, timestamp, payload).expect("sign");
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_valid_signature_passes() {
        let now = 1_700_000_000;
        let header = signed_header(now, PAYLOAD);
        assert!(verify_signature(SECRET, &header, PAYLOAD, now, 300).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let header = signed_header(now, PAYLOAD);
        let tampered = r#"{"id":"evt_1","type":"customer.subscription.deleted"}"#;
        let err = verify_signature(SECRET, &header, tampered, now, 300);
        assert!(matches!(err, Err(BillingError::SignatureRejected(_))));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = 1_700_000_000;
        let sig = compute_signature("whsec_other", now, PAYLOAD).expect("sign");
        let header = format!("t={},v1={}", now, sig);
        assert!(verify_signature(SECRET, &header, PAYLOAD, now, 300).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = 1_700_000_000;
        let header = signed_header(now - 301, PAYLOAD);
        let err = verify_signature(SECRET, &header, PAYLOAD, now, 300);
        assert!(matches!(err, Err(BillingError::SignatureRejected(_))));
    }

    #[test]
    fn test_timestamp_at_tolerance_boundary_passes() {
        let now = 1_700_000_000;
        let header = signed_header(now - 300, PAYLOAD);
        assert!(verify_signature(SECRET, &header, PAYLOAD, now, 300).is_ok());
    }

    #[test]
    fn test_future_timestamp_beyond_tolerance_rejected() {
        let now = 1_700_000_000;
        let header = signed_header(now + 400, PAYLOAD);
        assert!(verify_signature(SECRET, &header, PAYLOAD, now, 300).is_err());
    }

    #[test]
    fn test_missing_parts_rejected() {
        let now = 1_700_000_000;
        assert!(verify_signature(SECRET, "v1=abc", PAYLOAD, now, 300).is_err());
        assert!(verify_signature(SECRET, &format!("t={}", now), PAYLOAD, now, 300).is_err());
        assert!(verify_signature(SECRET, "garbage", PAYLOAD, now, 300).is_err());
        assert!(verify_signature(SECRET, "", PAYLOAD, now, 300).is_err());
    }

    #[test]
    fn test_rotation_header_with_one_valid_v1_passes() {
        let now = 1_700_000_000;
        let good = compute_signature(SECRET, now, PAYLOAD).expect("sign");
        let header = format!("t={},v1=deadbeef,v1={}", now, good);
        assert!(verify_signature(SECRET, &header, PAYLOAD, now, 300).is_ok());
    }

    #[test]
    fn test_secret_prefix_not_part_of_key() {
        let now = 1_700_000_000;
        let with_prefix = compute_signature("whsec_abc", now, PAYLOAD).expect("sign");
        let without_prefix = compute_signature("abc", now, PAYLOAD).expect("sign");
        assert_eq!(with_prefix, without_prefix);
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            WebhookEventKind::from_event_type("customer.subscription.created"),
            WebhookEventKind::SubscriptionCreated
        );
        assert_eq!(
            WebhookEventKind::from_event_type("invoice.payment_failed"),
            WebhookEventKind::PaymentFailed
        );
        assert_eq!(
            WebhookEventKind::from_event_type("customer.subscription.trial_will_end"),
            WebhookEventKind::TrialWillEnd
        );
        assert_eq!(
            WebhookEventKind::from_event_type("charge.refunded"),
            WebhookEventKind::Unrecognized
        );
        assert_eq!(
            WebhookEventKind::from_event_type(""),
            WebhookEventKind::Unrecognized
        );
    }

    #[test]
    fn test_processor_status_mapping() {
        assert_eq!(
            map_processor_status("active"),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            map_processor_status("trialing"),
            Some(SubscriptionStatus::Trialing)
        );
        assert_eq!(
            map_processor_status("past_due"),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(
            map_processor_status("canceled"),
            Some(SubscriptionStatus::Canceled)
        );
        assert_eq!(
            map_processor_status("unpaid"),
            Some(SubscriptionStatus::Canceled)
        );
        assert_eq!(map_processor_status("incomplete"), None);
    }

    #[test]
    fn test_ref_field_accepts_both_forms() {
        let bare = serde_json::json!({ "customer": "cus_123" });
        assert_eq!(ref_field(&bare, "customer"), Some("cus_123"));

        let expanded = serde_json::json!({ "customer": { "id": "cus_456", "email": "x@y.z" } });
        assert_eq!(ref_field(&expanded, "customer"), Some("cus_456"));

        let missing = serde_json::json!({});
        assert_eq!(ref_field(&missing, "customer"), None);

        let wrong_type = serde_json::json!({ "customer": 42 });
        assert_eq!(ref_field(&wrong_type, "customer"), None);
    }

    #[test]
    fn test_price_ref_extraction() {
        let modern = serde_json::json!({
            "items": { "data": [ { "price": { "id": "price_pro_m" } } ] }
        });
        assert_eq!(price_ref_of(&modern), Some("price_pro_m"));

        let legacy = serde_json::json!({ "plan": { "id": "price_basic_m" } });
        assert_eq!(price_ref_of(&legacy), Some("price_basic_m"));

        assert_eq!(price_ref_of(&serde_json::json!({})), None);
    }

    #[test]
    fn test_unix_ts_field() {
        let object = serde_json::json!({ "current_period_end": 1_700_000_000 });
        let ts = unix_ts_field(&object, "current_period_end");
        assert_eq!(ts.map(|t| t.unix_timestamp()), Some(1_700_000_000));
        assert_eq!(unix_ts_field(&object, "missing"), None);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(WebhookOutcome::Processed.as_str(), "processed");
        assert_eq!(WebhookOutcome::Duplicate.as_str(), "duplicate");
        assert_eq!(WebhookOutcome::Ignored.as_str(), "ignored");
    }
}
