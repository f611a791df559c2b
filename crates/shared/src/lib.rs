// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Mailtide Shared Types
//!
//! Domain enums and small helpers used by the billing core, the API server,
//! and the background worker.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{
    BillingCycle, NotificationKind, PlanId, ResourceKind, SubscriptionStatus, TransitionKind,
};
