//! Subscription transition history.
//!
//! Append-only ledger of every plan/status change: audit trail first, and a
//! secondary idempotency signal second. Rows carry the external event ref
//! that triggered them (unique when present), so a replayed event can never
//! append the same transition twice — the insert is `ON CONFLICT DO NOTHING`
//! on that column.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use mailtide_shared::types::TransitionKind;

use crate::error::{BillingError, BillingResult};

/// One transition waiting to be appended. Built fluently, written once.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub org_id: Uuid,
    pub kind: TransitionKind,
    pub external_event_ref: Option<String>,
    pub old_plan: Option<String>,
    pub new_plan: Option<String>,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: String,
    pub invoice_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
}

impl TransitionRecord {
    pub fn new(org_id: Uuid, kind: TransitionKind) -> Self {
        Self {
            org_id,
            kind,
            external_event_ref: None,
            old_plan: None,
            new_plan: None,
            old_status: None,
            new_status: None,
            amount_cents: None,
            currency: "usd".to_string(),
            invoice_ref: None,
            failure_reason: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn plans(mut self, old: &str, new: &str) -> Self {
        self.old_plan = Some(old.to_string());
        self.new_plan = Some(new.to_string());
        self
    }

    pub fn statuses(mut self, old: &str, new: &str) -> Self {
        self.old_status = Some(old.to_string());
        self.new_status = Some(new.to_string());
        self
    }

    pub fn external_event(mut self, event_ref: &str) -> Self {
        self.external_event_ref = Some(event_ref.to_string());
        self
    }

    pub fn external_event_opt(mut self, event_ref: Option<&str>) -> Self {
        self.external_event_ref = event_ref.map(|r| r.to_string());
        self
    }

    pub fn amount_cents(mut self, cents: i64) -> Self {
        self.amount_cents = Some(cents);
        self
    }

    pub fn invoice_ref(mut self, invoice: &str) -> Self {
        self.invoice_ref = Some(invoice.to_string());
        self
    }

    pub fn failure_reason(mut self, reason: &str) -> Self {
        self.failure_reason = Some(reason.to_string());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A stored transition row.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TransitionRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub event_type: String,
    pub external_event_ref: Option<String>,
    pub old_plan: Option<String>,
    pub new_plan: Option<String>,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: String,
    pub invoice_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

const INSERT_TRANSITION: &str = r#"
    INSERT INTO subscription_transitions
        (org_id, event_type, external_event_ref, old_plan, new_plan,
         old_status, new_status, amount_cents, currency, invoice_ref,
         failure_reason, metadata)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (external_event_ref) DO NOTHING
    RETURNING id
"#;

/// Writer/reader for the transition ledger.
#[derive(Clone)]
pub struct HistoryService {
    pool: PgPool,
}

impl HistoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a transition. Returns `None` when a transition with the same
    /// external event ref was already recorded (replay — nothing written).
    pub async fn record(&self, record: TransitionRecord) -> BillingResult<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(INSERT_TRANSITION)
            .bind(record.org_id)
            .bind(record.kind.as_str())
            .bind(&record.external_event_ref)
            .bind(&record.old_plan)
            .bind(&record.new_plan)
            .bind(&record.old_status)
            .bind(&record.new_status)
            .bind(record.amount_cents)
            .bind(&record.currency)
            .bind(&record.invoice_ref)
            .bind(&record.failure_reason)
            .bind(&record.metadata)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        if id.is_none() {
            tracing::warn!(
                org_id = %record.org_id,
                kind = %record.kind,
                event_ref = ?record.external_event_ref,
                "Transition already recorded for event ref, skipping append"
            );
        }
        Ok(id)
    }

    /// Append inside a caller-held transaction, so the transition lands in
    /// the same unit as the organization update it describes.
    pub async fn record_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: TransitionRecord,
    ) -> BillingResult<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(INSERT_TRANSITION)
            .bind(record.org_id)
            .bind(record.kind.as_str())
            .bind(&record.external_event_ref)
            .bind(&record.old_plan)
            .bind(&record.new_plan)
            .bind(&record.old_status)
            .bind(&record.new_status)
            .bind(record.amount_cents)
            .bind(&record.currency)
            .bind(&record.invoice_ref)
            .bind(&record.failure_reason)
            .bind(&record.metadata)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(id)
    }

    pub async fn recent_for_org(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<TransitionRow>> {
        sqlx::query_as(
            r#"
            SELECT id, org_id, event_type, external_event_ref, old_plan, new_plan,
                   old_status, new_status, amount_cents, currency, invoice_ref,
                   failure_reason, metadata, created_at
            FROM subscription_transitions
            WHERE org_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let org_id = Uuid::new_v4();
        let record = TransitionRecord::new(org_id, TransitionKind::Created);
        assert_eq!(record.org_id, org_id);
        assert_eq!(record.currency, "usd");
        assert!(record.external_event_ref.is_none());
        assert_eq!(record.metadata, serde_json::json!({}));
    }

    #[test]
    fn test_builder_chain() {
        let record = TransitionRecord::new(Uuid::new_v4(), TransitionKind::PaymentFailed)
            .plans("pro_monthly", "pro_monthly")
            .statuses("active", "past_due")
            .amount_cents(7_900)
            .invoice_ref("in_123")
            .failure_reason("card_declined")
            .external_event("evt_42")
            .metadata(serde_json::json!({"attempt": 2}));

        assert_eq!(record.old_status.as_deref(), Some("active"));
        assert_eq!(record.new_status.as_deref(), Some("past_due"));
        assert_eq!(record.amount_cents, Some(7_900));
        assert_eq!(record.external_event_ref.as_deref(), Some("evt_42"));
        assert_eq!(record.metadata["attempt"], 2);
    }

    #[test]
    fn test_external_event_opt() {
        let with_ref = TransitionRecord::new(Uuid::new_v4(), TransitionKind::Updated)
            .external_event_opt(Some("evt_1"));
        assert_eq!(with_ref.external_event_ref.as_deref(), Some("evt_1"));

        let without = TransitionRecord::new(Uuid::new_v4(), TransitionKind::Updated)
            .external_event_opt(None);
        assert!(without.external_event_ref.is_none());
    }
}
