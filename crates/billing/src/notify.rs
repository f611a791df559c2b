//! Customer Notification Dispatch
//!
//! The billing core does not render or deliver email. It records
//! notification events and forwards each one to the platform's dispatch
//! callback, which owns templating and delivery. The insert is the source of
//! truth; callback delivery is best-effort and never fails the caller.
//!
//! Repeat-prone kinds (reminders, payment retries, usage warnings) are
//! deduplicated against recent rows so a daily sweep or a retrying processor
//! cannot spam a customer with the same message.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use mailtide_shared::types::NotificationKind;

use crate::error::{BillingError, BillingResult};

/// Repeat usage warnings only when the percentage moved more than this many
/// points since the last one.
const USAGE_WARNING_REPEAT_DELTA: f64 = 5.0;

const REMINDER_DEDUPE_HOURS: i32 = 24;
const USAGE_DEDUPE_HOURS: i32 = 48;

/// What a notify call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Recorded (and handed to the callback if one is configured).
    Dispatched,
    /// A matching notification was sent recently; nothing recorded.
    Suppressed,
}

/// How duplicates are detected for a notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DedupeRule {
    /// Always dispatch.
    None,
    /// Suppress if the same kind fired within the window.
    KindWithinHours(i32),
    /// Suppress if the same kind fired within the window with the same
    /// `days_remaining` metadata (a 7-day and a 1-day reminder are distinct).
    SameDaysWithinHours(i32),
    /// Suppress if a warning for the same resource fired within the window at
    /// a similar percentage.
    SameResourceWithinHours(i32),
}

fn dedupe_rule(kind: NotificationKind) -> DedupeRule {
    match kind {
        NotificationKind::TrialEndingSoon | NotificationKind::SubscriptionEndingSoon => {
            DedupeRule::SameDaysWithinHours(REMINDER_DEDUPE_HOURS)
        }
        // The processor retries failed invoices on its own schedule; one
        // warning a day is enough.
        NotificationKind::PaymentFailed => DedupeRule::KindWithinHours(REMINDER_DEDUPE_HOURS),
        NotificationKind::UsageWarning => DedupeRule::SameResourceWithinHours(USAGE_DEDUPE_HOURS),
        _ => DedupeRule::None,
    }
}

async fn post_callback(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
) -> Result<(), String> {
    let response = client
        .post(url)
        .json(body)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("callback returned {}", response.status()));
    }
    Ok(())
}

/// Notification recording and forwarding service.
#[derive(Clone)]
pub struct NotificationService {
    pool: PgPool,
    client: reqwest::Client,
    callback_url: Option<String>,
}

impl NotificationService {
    pub fn new(pool: PgPool, callback_url: Option<String>) -> Self {
        Self {
            pool,
            client: reqwest::Client::new(),
            callback_url,
        }
    }

    /// Record a notification and forward it to the dispatch callback.
    /// Returns `Suppressed` without writing anything when the dedupe window
    /// already holds a matching row.
    pub async fn notify(
        &self,
        org_id: Uuid,
        kind: NotificationKind,
        metadata: Value,
    ) -> BillingResult<NotificationOutcome> {
        if self.is_recent_duplicate(org_id, kind, &metadata).await? {
            tracing::debug!(
                org_id = %org_id,
                kind = %kind,
                "Notification suppressed by dedupe window"
            );
            return Ok(NotificationOutcome::Suppressed);
        }

        let (notification_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO notifications (org_id, kind, metadata)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(org_id)
        .bind(kind.as_str())
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %org_id,
            kind = %kind,
            notification_id = %notification_id,
            "Notification recorded"
        );

        if let Some(url) = &self.callback_url {
            let body = serde_json::json!({
                "organization_id": org_id,
                "kind": kind.as_str(),
                "metadata": metadata,
            });
            if let Err(e) = post_callback(&self.client, url, &body).await {
                tracing::warn!(
                    org_id = %org_id,
                    kind = %kind,
                    error = %e,
                    "Notification callback delivery failed"
                );
            }
        } else {
            tracing::debug!(kind = %kind, "No notification callback configured, row recorded only");
        }

        Ok(NotificationOutcome::Dispatched)
    }

    async fn is_recent_duplicate(
        &self,
        org_id: Uuid,
        kind: NotificationKind,
        metadata: &Value,
    ) -> BillingResult<bool> {
        let (count,): (i64,) = match dedupe_rule(kind) {
            DedupeRule::None => return Ok(false),
            DedupeRule::KindWithinHours(hours) => sqlx::query_as(
                r#"
                SELECT COUNT(*) FROM notifications
                WHERE org_id = $1 AND kind = $2
                  AND created_at > NOW() - make_interval(hours => $3::int)
                "#,
            )
            .bind(org_id)
            .bind(kind.as_str())
            .bind(hours)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?,
            DedupeRule::SameDaysWithinHours(hours) => {
                let days_remaining = metadata.get("days_remaining").and_then(Value::as_i64);
                sqlx::query_as(
                    r#"
                    SELECT COUNT(*) FROM notifications
                    WHERE org_id = $1 AND kind = $2
                      AND created_at > NOW() - make_interval(hours => $3::int)
                      AND (metadata->>'days_remaining')::bigint IS NOT DISTINCT FROM $4
                    "#,
                )
                .bind(org_id)
                .bind(kind.as_str())
                .bind(hours)
                .bind(days_remaining)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?
            }
            DedupeRule::SameResourceWithinHours(hours) => {
                let resource = metadata.get("resource").and_then(Value::as_str);
                let percent = metadata
                    .get("percent_used")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                sqlx::query_as(
                    r#"
                    SELECT COUNT(*) FROM notifications
                    WHERE org_id = $1 AND kind = $2
                      AND created_at > NOW() - make_interval(hours => $3::int)
                      AND metadata->>'resource' IS NOT DISTINCT FROM $4
                      AND ABS(COALESCE((metadata->>'percent_used')::float8, 0) - $5) <= $6
                    "#,
                )
                .bind(org_id)
                .bind(kind.as_str())
                .bind(hours)
                .bind(resource)
                .bind(percent)
                .bind(USAGE_WARNING_REPEAT_DELTA)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?
            }
        };
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_rules_per_kind() {
        assert_eq!(
            dedupe_rule(NotificationKind::TrialEndingSoon),
            DedupeRule::SameDaysWithinHours(24)
        );
        assert_eq!(
            dedupe_rule(NotificationKind::SubscriptionEndingSoon),
            DedupeRule::SameDaysWithinHours(24)
        );
        assert_eq!(
            dedupe_rule(NotificationKind::PaymentFailed),
            DedupeRule::KindWithinHours(24)
        );
        assert_eq!(
            dedupe_rule(NotificationKind::UsageWarning),
            DedupeRule::SameResourceWithinHours(48)
        );
        assert_eq!(dedupe_rule(NotificationKind::PaymentSucceeded), DedupeRule::None);
        assert_eq!(
            dedupe_rule(NotificationKind::SubscriptionActivated),
            DedupeRule::None
        );
        assert_eq!(dedupe_rule(NotificationKind::TrialExpired), DedupeRule::None);
    }

    #[tokio::test]
    async fn test_post_callback_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/notify")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "kind": "usage_warning",
            })))
            .with_status(200)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "organization_id": Uuid::new_v4(),
            "kind": "usage_warning",
            "metadata": { "resource": "contacts", "percent_used": 92.0 },
        });
        let result = post_callback(&client, &format!("{}/notify", server.url()), &body).await;
        assert!(result.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_post_callback_non_success_status_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/notify")
            .with_status(503)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let body = serde_json::json!({ "kind": "payment_failed" });
        let result = post_callback(&client, &format!("{}/notify", server.url()), &body).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_post_callback_unreachable_host_is_error() {
        let client = reqwest::Client::new();
        let body = serde_json::json!({ "kind": "trial_expired" });
        let result = post_callback(&client, "http://127.0.0.1:1/notify", &body).await;
        assert!(result.is_err());
    }
}
