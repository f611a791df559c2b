// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Mailtide API Library
//!
//! HTTP surface for the billing subsystem: the payment-processor webhook
//! endpoint, the customer-facing subscription routes, and the entitlement
//! gate middleware applied to the rest of the API tree.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
