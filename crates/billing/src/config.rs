//! Billing configuration loaded from the environment.
//!
//! Thresholds that drive customer-visible behavior (grace length, reminder
//! offsets, usage-warning percentage) are configuration rather than
//! constants so they can be tuned without a deploy.

use std::collections::HashMap;

use mailtide_shared::types::PlanId;

use crate::error::{BillingError, BillingResult};

/// Connection details for the payment processor's management API.
///
/// The API key is optional: without it, plan changes and cancellations apply
/// locally only, which is the expected mode for development environments.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub api_base: String,
    pub api_key: Option<String>,
}

impl ProcessorConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// Maximum age of a signed webhook timestamp, in seconds.
    pub signature_tolerance_secs: i64,
    /// Minutes after which an event stuck in `processing` may be reclaimed.
    pub event_recovery_minutes: i64,
    /// Length of the trial window granted at signup and after cancellation.
    pub trial_length_days: i64,
    /// Days of continued access after a failed payment.
    pub grace_period_days: i64,
    /// Days-before-expiry offsets at which trial reminders fire.
    pub trial_reminder_days: Vec<i64>,
    /// Days-before-period-end offsets for cancel-at-period-end reminders.
    pub subscription_reminder_days: Vec<i64>,
    /// Usage percentage at which a warning notification fires.
    pub usage_warning_percent: i64,
    /// Endpoint receiving the fire-and-forget notification callback POSTs.
    pub notification_callback_url: Option<String>,
    /// Processor price reference -> plan, for webhook plan resolution.
    pub price_refs: HashMap<String, PlanId>,
    pub processor: ProcessorConfig,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("BILLING_WEBHOOK_SECRET").map_err(|_| {
            BillingError::Configuration("BILLING_WEBHOOK_SECRET must be set".to_string())
        })?;

        Ok(Self {
            webhook_secret,
            signature_tolerance_secs: env_i64("BILLING_SIGNATURE_TOLERANCE_SECS", 300),
            event_recovery_minutes: env_i64("BILLING_EVENT_RECOVERY_MINUTES", 30),
            trial_length_days: env_i64("BILLING_TRIAL_LENGTH_DAYS", 14),
            grace_period_days: env_i64("BILLING_PAYMENT_GRACE_DAYS", 3),
            trial_reminder_days: env_i64_list("BILLING_TRIAL_REMINDER_DAYS", &[7, 1]),
            subscription_reminder_days: env_i64_list("BILLING_SUBSCRIPTION_REMINDER_DAYS", &[3, 1]),
            usage_warning_percent: env_i64("BILLING_USAGE_WARNING_PERCENT", 90),
            notification_callback_url: std::env::var("NOTIFICATION_CALLBACK_URL").ok(),
            price_refs: price_refs_from_env(),
            processor: ProcessorConfig {
                api_base: std::env::var("PROCESSOR_API_BASE")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
                api_key: std::env::var("PROCESSOR_API_KEY").ok(),
            },
        })
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            signature_tolerance_secs: 300,
            event_recovery_minutes: 30,
            trial_length_days: 14,
            grace_period_days: 3,
            trial_reminder_days: vec![7, 1],
            subscription_reminder_days: vec![3, 1],
            usage_warning_percent: 90,
            notification_callback_url: None,
            price_refs: HashMap::new(),
            processor: ProcessorConfig {
                api_base: "https://api.stripe.com".to_string(),
                api_key: None,
            },
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses a comma-separated list like "7,1". Invalid entries are skipped;
/// an empty result falls back to the default.
fn env_i64_list(key: &str, default: &[i64]) -> Vec<i64> {
    let parsed: Vec<i64> = std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();
    if parsed.is_empty() {
        default.to_vec()
    } else {
        parsed
    }
}

fn price_refs_from_env() -> HashMap<String, PlanId> {
    const PRICE_ENV_VARS: [(&str, PlanId); 6] = [
        ("PRICE_REF_BASIC_MONTHLY", PlanId::BasicMonthly),
        ("PRICE_REF_BASIC_YEARLY", PlanId::BasicYearly),
        ("PRICE_REF_PRO_MONTHLY", PlanId::ProMonthly),
        ("PRICE_REF_PRO_YEARLY", PlanId::ProYearly),
        ("PRICE_REF_PREMIUM_MONTHLY", PlanId::PremiumMonthly),
        ("PRICE_REF_PREMIUM_YEARLY", PlanId::PremiumYearly),
    ];

    let mut refs = HashMap::new();
    for (var, plan) in PRICE_ENV_VARS {
        if let Ok(price_ref) = std::env::var(var) {
            if !price_ref.is_empty() {
                refs.insert(price_ref, plan);
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env_requires_secret() {
        std::env::remove_var("BILLING_WEBHOOK_SECRET");
        assert!(BillingConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        std::env::set_var("BILLING_WEBHOOK_SECRET", "whsec_test");
        std::env::remove_var("BILLING_TRIAL_REMINDER_DAYS");
        std::env::remove_var("BILLING_PAYMENT_GRACE_DAYS");

        let config = BillingConfig::from_env().expect("config");
        assert_eq!(config.webhook_secret, "whsec_test");
        assert_eq!(config.grace_period_days, 3);
        assert_eq!(config.trial_reminder_days, vec![7, 1]);
        assert_eq!(config.usage_warning_percent, 90);
        assert!(!config.processor.is_configured());

        std::env::remove_var("BILLING_WEBHOOK_SECRET");
    }

    #[test]
    #[serial]
    fn test_reminder_list_parsing() {
        std::env::set_var("BILLING_WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("BILLING_TRIAL_REMINDER_DAYS", "14, 7,1");

        let config = BillingConfig::from_env().expect("config");
        assert_eq!(config.trial_reminder_days, vec![14, 7, 1]);

        std::env::remove_var("BILLING_TRIAL_REMINDER_DAYS");
        std::env::remove_var("BILLING_WEBHOOK_SECRET");
    }

    #[test]
    #[serial]
    fn test_price_refs_from_env() {
        std::env::set_var("BILLING_WEBHOOK_SECRET", "whsec_test");
        std::env::set_var("PRICE_REF_PRO_MONTHLY", "price_pro_m");

        let config = BillingConfig::from_env().expect("config");
        assert_eq!(config.price_refs.get("price_pro_m"), Some(&PlanId::ProMonthly));

        std::env::remove_var("PRICE_REF_PRO_MONTHLY");
        std::env::remove_var("BILLING_WEBHOOK_SECRET");
    }
}
