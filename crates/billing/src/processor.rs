//! Payment processor management API client.
//!
//! Covers the three outbound calls this subsystem makes: move a subscription
//! to a different price, cancel (immediately or at period end), and resume.
//! Calls are request-scoped; a failure here must surface before any local
//! state is touched, and retrying is the caller's concern.
//!
//! Without an API key the client runs in local-only mode: every call logs and
//! succeeds without network I/O, which is what development environments want.

use crate::config::ProcessorConfig;
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct ProcessorClient {
    client: reqwest::Client,
    config: ProcessorConfig,
}

impl ProcessorClient {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Move the subscription's single item to a new price. `prorate` controls
    /// whether the processor invoices the difference now (immediate changes)
    /// or not (period-end changes).
    pub async fn update_subscription_price(
        &self,
        subscription_ref: &str,
        price_ref: &str,
        prorate: bool,
    ) -> BillingResult<()> {
        let Some(api_key) = &self.config.api_key else {
            tracing::debug!(
                subscription_ref = %subscription_ref,
                "Processor not configured, skipping price update"
            );
            return Ok(());
        };

        let proration_behavior = if prorate { "create_prorations" } else { "none" };
        let params = [
            ("items[0][price]", price_ref),
            ("proration_behavior", proration_behavior),
        ];

        let response = self
            .client
            .post(format!(
                "{}/v1/subscriptions/{}",
                self.config.api_base, subscription_ref
            ))
            .bearer_auth(api_key)
            .form(&params)
            .send()
            .await
            .map_err(|e| BillingError::Processor(e.to_string()))?;

        Self::check_status(response, "update subscription price").await
    }

    /// Cancel a subscription. With `at_period_end` the subscription stays
    /// active until the period closes and the deletion webhook arrives later;
    /// otherwise it is deleted now.
    pub async fn cancel_subscription(
        &self,
        subscription_ref: &str,
        at_period_end: bool,
    ) -> BillingResult<()> {
        let Some(api_key) = &self.config.api_key else {
            tracing::debug!(
                subscription_ref = %subscription_ref,
                "Processor not configured, skipping cancellation"
            );
            return Ok(());
        };

        let response = if at_period_end {
            self.client
                .post(format!(
                    "{}/v1/subscriptions/{}",
                    self.config.api_base, subscription_ref
                ))
                .bearer_auth(api_key)
                .form(&[("cancel_at_period_end", "true")])
                .send()
                .await
        } else {
            self.client
                .delete(format!(
                    "{}/v1/subscriptions/{}",
                    self.config.api_base, subscription_ref
                ))
                .bearer_auth(api_key)
                .send()
                .await
        }
        .map_err(|e| BillingError::Processor(e.to_string()))?;

        Self::check_status(response, "cancel subscription").await
    }

    /// Clear a pending at-period-end cancellation.
    pub async fn resume_subscription(&self, subscription_ref: &str) -> BillingResult<()> {
        let Some(api_key) = &self.config.api_key else {
            tracing::debug!(
                subscription_ref = %subscription_ref,
                "Processor not configured, skipping resume"
            );
            return Ok(());
        };

        let response = self
            .client
            .post(format!(
                "{}/v1/subscriptions/{}",
                self.config.api_base, subscription_ref
            ))
            .bearer_auth(api_key)
            .form(&[("cancel_at_period_end", "false")])
            .send()
            .await
            .map_err(|e| BillingError::Processor(e.to_string()))?;

        Self::check_status(response, "resume subscription").await
    }

    async fn check_status(response: reqwest::Response, action: &str) -> BillingResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(BillingError::Processor(format!(
            "{} failed with {}: {}",
            action, status, body
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> ProcessorClient {
        ProcessorClient::new(ProcessorConfig {
            api_base: server.url(),
            api_key: Some("sk_test_123".to_string()),
        })
    }

    #[tokio::test]
    async fn test_update_price_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/subscriptions/sub_42")
            .match_header("authorization", "Bearer sk_test_123")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("items[0][price]".into(), "price_pro_m".into()),
                mockito::Matcher::UrlEncoded("proration_behavior".into(), "create_prorations".into()),
            ]))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = client_for(&server);
        client
            .update_subscription_price("sub_42", "price_pro_m", true)
            .await
            .expect("update succeeds");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_uses_post() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/subscriptions/sub_42")
            .match_body(mockito::Matcher::UrlEncoded(
                "cancel_at_period_end".into(),
                "true".into(),
            ))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = client_for(&server);
        client
            .cancel_subscription("sub_42", true)
            .await
            .expect("cancel succeeds");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_immediate_cancel_uses_delete() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/v1/subscriptions/sub_42")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = client_for(&server);
        client
            .cancel_subscription("sub_42", false)
            .await
            .expect("cancel succeeds");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_processor_error_propagates() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/subscriptions/sub_42")
            .with_status(402)
            .with_body(r#"{"error": "payment_required"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client
            .resume_subscription("sub_42")
            .await
            .expect_err("should fail");
        assert!(matches!(err, BillingError::Processor(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_client_skips_network() {
        let client = ProcessorClient::new(ProcessorConfig {
            api_base: "http://127.0.0.1:1".to_string(),
            api_key: None,
        });
        // Would fail if it actually dialed the dead address.
        client
            .update_subscription_price("sub_42", "price_x", false)
            .await
            .expect("local-only mode succeeds");
        assert!(!client.is_configured());
    }
}
