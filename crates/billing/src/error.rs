//! Billing error types.
//!
//! Gate denials (limit reached, feature unavailable, subscription inactive)
//! are not errors; they are returned as [`crate::entitlement::AccessDecision`]
//! values. A duplicate webhook delivery is not an error either; it surfaces
//! as [`crate::webhooks::WebhookOutcome::Duplicate`].

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Storage-level failure. Webhook processing treats this as transient:
    /// the event stays retryable.
    #[error("Database error: {0}")]
    Database(String),

    /// Missing or invalid webhook signature. Rejected before the body is
    /// parsed; nothing is written.
    #[error("Webhook signature rejected: {0}")]
    SignatureRejected(String),

    /// The event references a customer/subscription no organization carries.
    /// Logged and swallowed at the dispatch layer; retrying cannot fix it.
    #[error("No organization for reference: {0}")]
    UnresolvedTarget(String),

    /// The event or request references a price/plan the catalog does not know.
    #[error("Unknown plan reference: {0}")]
    UnknownPlanReference(String),

    /// The webhook body is not a well-formed event envelope.
    #[error("Malformed event payload: {0}")]
    MalformedPayload(String),

    /// Caller-supplied request data failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The payment processor's management API call failed. Local state is
    /// never mutated when this is returned.
    #[error("Payment processor error: {0}")]
    Processor(String),

    /// Required configuration is absent or unparseable.
    #[error("Configuration error: {0}")]
    Configuration(String),
}
