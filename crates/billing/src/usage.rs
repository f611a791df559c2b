//! Usage Ledger
//!
//! Per-organization, per-calendar-month consumption counters. Increments are
//! a single upsert-add statement so concurrent requests can never lose
//! updates; there is no read-modify-write anywhere in this module.
//!
//! Flow resources (emails sent, api calls, imports) live in the counters
//! because their history matters for billing. Stock resources (contacts,
//! campaigns, templates, domains) are read as live `COUNT(*)` totals from
//! their own tables, since rows can be deleted and a counter would drift.

use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use mailtide_shared::types::ResourceKind;

use crate::error::{BillingError, BillingResult};

/// First day of the month containing `now`; the key for `usage_records`.
pub fn month_key(now: OffsetDateTime) -> Date {
    Date::from_calendar_date(now.year(), now.month(), 1).unwrap_or_else(|_| now.date())
}

/// Monthly counters plus live stock totals for one organization.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UsageSnapshot {
    pub emails_sent: i64,
    pub campaigns_created: i64,
    pub contacts_imported: i64,
    pub templates_created: i64,
    pub domains_verified: i64,
    pub api_calls: i64,
    pub ab_tests_created: i64,
    pub total_contacts: i64,
    pub total_campaigns: i64,
    pub total_templates: i64,
    pub total_domains: i64,
}

impl UsageSnapshot {
    /// The value the entitlement gate compares against the plan limit:
    /// live totals for stock resources, monthly counters for flow resources.
    pub fn current_for(&self, resource: ResourceKind) -> i64 {
        match resource {
            ResourceKind::Contacts => self.total_contacts,
            ResourceKind::Campaigns => self.total_campaigns,
            ResourceKind::Templates => self.total_templates,
            ResourceKind::Domains => self.total_domains,
            ResourceKind::Emails => self.emails_sent,
            ResourceKind::ApiCalls => self.api_calls,
            ResourceKind::AbTests => self.ab_tests_created,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CountersRow {
    emails_sent: i64,
    campaigns_created: i64,
    contacts_imported: i64,
    templates_created: i64,
    domains_verified: i64,
    api_calls: i64,
    ab_tests_created: i64,
}

#[derive(Clone)]
pub struct UsageService {
    pool: PgPool,
}

impl UsageService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically add `amount` to this month's counter for `resource`,
    /// creating the month row if it does not exist yet. One statement; safe
    /// under any number of concurrent callers.
    pub async fn increment(
        &self,
        org_id: Uuid,
        resource: ResourceKind,
        amount: i64,
    ) -> BillingResult<()> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "usage increment must be positive, got {}",
                amount
            )));
        }

        // Column name comes from the enum table, never from user input.
        let column = resource.counter_column();
        let sql = format!(
            r#"
            INSERT INTO usage_records (org_id, month, {column})
            VALUES ($1, $2, $3)
            ON CONFLICT (org_id, month)
            DO UPDATE SET {column} = usage_records.{column} + EXCLUDED.{column},
                          updated_at = NOW()
            "#
        );

        sqlx::query(&sql)
            .bind(org_id)
            .bind(month_key(OffsetDateTime::now_utc()))
            .bind(amount)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::debug!(
            org_id = %org_id,
            resource = %resource,
            amount = amount,
            "Usage incremented"
        );
        Ok(())
    }

    /// All counters for the current month plus live stock totals. Months
    /// with no activity yet read as zeros; no row is created.
    pub async fn current_usage(&self, org_id: Uuid) -> BillingResult<UsageSnapshot> {
        self.usage_for_month(org_id, month_key(OffsetDateTime::now_utc()))
            .await
    }

    pub async fn usage_for_month(&self, org_id: Uuid, month: Date) -> BillingResult<UsageSnapshot> {
        let counters: Option<CountersRow> = sqlx::query_as(
            r#"
            SELECT emails_sent, campaigns_created, contacts_imported,
                   templates_created, domains_verified, api_calls, ab_tests_created
            FROM usage_records
            WHERE org_id = $1 AND month = $2
            "#,
        )
        .bind(org_id)
        .bind(month)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let (total_contacts, total_campaigns, total_templates, total_domains): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM contacts WHERE org_id = $1),
                    (SELECT COUNT(*) FROM campaigns WHERE org_id = $1),
                    (SELECT COUNT(*) FROM templates WHERE org_id = $1),
                    (SELECT COUNT(*) FROM sending_domains WHERE org_id = $1)
                "#,
            )
            .bind(org_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let mut snapshot = UsageSnapshot {
            total_contacts,
            total_campaigns,
            total_templates,
            total_domains,
            ..UsageSnapshot::default()
        };
        if let Some(row) = counters {
            snapshot.emails_sent = row.emails_sent;
            snapshot.campaigns_created = row.campaigns_created;
            snapshot.contacts_imported = row.contacts_imported;
            snapshot.templates_created = row.templates_created;
            snapshot.domains_verified = row.domains_verified;
            snapshot.api_calls = row.api_calls;
            snapshot.ab_tests_created = row.ab_tests_created;
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    #[test]
    fn test_month_key_is_first_of_month() {
        let mid = OffsetDateTime::now_utc().replace_day(15).expect("day 15");
        let key = month_key(mid);
        assert_eq!(key.day(), 1);
        assert_eq!(key.month(), mid.month());
        assert_eq!(key.year(), mid.year());
    }

    #[test]
    fn test_month_key_december() {
        let dec = Date::from_calendar_date(2025, Month::December, 31)
            .expect("date")
            .midnight()
            .assume_utc();
        assert_eq!(month_key(dec).month(), Month::December);
        assert_eq!(month_key(dec).day(), 1);
    }

    #[test]
    fn test_current_for_stock_uses_live_totals() {
        let snapshot = UsageSnapshot {
            contacts_imported: 500,
            total_contacts: 120,
            campaigns_created: 9,
            total_campaigns: 4,
            ..UsageSnapshot::default()
        };
        // Imports this month are history; the live total is what limits see.
        assert_eq!(snapshot.current_for(ResourceKind::Contacts), 120);
        assert_eq!(snapshot.current_for(ResourceKind::Campaigns), 4);
    }

    #[test]
    fn test_current_for_flow_uses_counters() {
        let snapshot = UsageSnapshot {
            emails_sent: 9_000,
            api_calls: 42,
            ..UsageSnapshot::default()
        };
        assert_eq!(snapshot.current_for(ResourceKind::Emails), 9_000);
        assert_eq!(snapshot.current_for(ResourceKind::ApiCalls), 42);
    }
}
