// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Mailtide Billing Module
//!
//! The subscription lifecycle for the email platform: webhook-driven state,
//! plan entitlements, and the scheduled sweep.
//!
//! ## Features
//!
//! - **Webhook Ingestion**: Signed processor events with an idempotency ledger
//! - **Subscription State**: Trial, active, past-due, and canceled transitions
//! - **Plan Catalog**: Limits and feature flags per plan and billing cycle
//! - **Entitlements**: Feature gates and resource limit checks
//! - **Usage Ledger**: Per-month counters behind the limit checks
//! - **Sweep**: Expirations, reminders, usage warnings, pending plan changes
//! - **Notifications**: Deduplicated records with a best-effort callback
//! - **Invariants**: Runnable consistency checks over the billing tables

pub mod catalog;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod history;
pub mod invariants;
pub mod notify;
pub mod processor;
pub mod subscriptions;
pub mod sweep;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{FeatureFlag, PlanCatalog, PlanDefinition, PlanFeatures};

// Config
pub use config::{BillingConfig, ProcessorConfig};

// Entitlement
pub use entitlement::{
    subscription_active, AccessDecision, DenyCode, EntitlementService, LimitCheck,
};

// Error
pub use error::{BillingError, BillingResult};

// History
pub use history::{HistoryService, TransitionRecord, TransitionRow};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notify
pub use notify::{NotificationOutcome, NotificationService};

// Processor
pub use processor::ProcessorClient;

// Subscriptions
pub use subscriptions::{
    ChangePlanOptions, Organization, PlanChangeResult, PlanChangeSource, SubscriptionService,
};

// Sweep
pub use sweep::{
    ExpirationSweepSummary, PendingPlanSummary, ReminderSweepSummary, SweepService,
    UsageWarningSummary,
};

// Usage
pub use usage::{UsageService, UsageSnapshot};

// Webhooks
pub use webhooks::{WebhookOutcome, WebhookService};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: BillingConfig,
    pub catalog: Arc<PlanCatalog>,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookService,
    pub entitlements: EntitlementService,
    pub usage: UsageService,
    pub sweep: SweepService,
    pub notifications: NotificationService,
    pub history: HistoryService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(BillingConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: BillingConfig, pool: PgPool) -> Self {
        let catalog = Arc::new(PlanCatalog::new(config.price_refs.clone()));

        Self {
            subscriptions: SubscriptionService::new(
                config.clone(),
                catalog.clone(),
                pool.clone(),
            ),
            webhooks: WebhookService::new(config.clone(), catalog.clone(), pool.clone()),
            entitlements: EntitlementService::new(catalog.clone(), pool.clone()),
            usage: UsageService::new(pool.clone()),
            sweep: SweepService::new(config.clone(), catalog.clone(), pool.clone()),
            notifications: NotificationService::new(
                pool.clone(),
                config.notification_callback_url.clone(),
            ),
            history: HistoryService::new(pool.clone()),
            invariants: InvariantChecker::new(catalog.clone(), pool),
            catalog,
            config,
        }
    }
}
