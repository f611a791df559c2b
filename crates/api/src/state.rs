//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use mailtide_billing::{BillingResult, BillingService};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> BillingResult<Self> {
        let billing = Arc::new(BillingService::from_env(pool.clone())?);

        if billing.config.notification_callback_url.is_some() {
            tracing::info!("Notification callback dispatch enabled");
        } else {
            tracing::warn!(
                "Notification callback not configured (missing NOTIFICATION_CALLBACK_URL) - \
                 notifications will be recorded but not delivered"
            );
        }

        if billing.config.processor.is_configured() {
            tracing::info!("Payment processor API configured");
        } else {
            tracing::warn!(
                "Payment processor API key not set - plan changes apply locally only"
            );
        }

        Ok(Self {
            pool,
            config,
            billing,
        })
    }
}
