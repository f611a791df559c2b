//! API error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use mailtide_billing::{AccessDecision, BillingError};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    /// Webhook signature missing or failed verification.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Entitlement denial. Status is 402 for payment states, 403 otherwise.
    #[error("Access denied")]
    AccessDenied(AccessDecision),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error")]
    Internal,
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::UnresolvedTarget(_) => ApiError::NotFound,
            BillingError::SignatureRejected(_) => ApiError::InvalidSignature,
            BillingError::InvalidInput(msg) | BillingError::MalformedPayload(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::UnknownPlanReference(r) => {
                ApiError::Validation(format!("unknown plan: {r}"))
            }
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Processor(msg) => {
                tracing::error!(error = %msg, "Payment processor call failed");
                ApiError::Internal
            }
            BillingError::Configuration(msg) => {
                tracing::error!(error = %msg, "Billing misconfigured");
                ApiError::Internal
            }
        }
    }
}

/// Status for an entitlement denial: payment problems are 402 so clients can
/// route the user to billing; feature and limit denials are 403.
pub fn deny_status(decision: &AccessDecision) -> StatusCode {
    match decision.code {
        Some(code) if code.is_subscription_state() => StatusCode::PAYMENT_REQUIRED,
        _ => StatusCode::FORBIDDEN,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::AccessDenied(decision) = self {
            let status = deny_status(&decision);
            let body = Json(json!({
                "error": decision.message,
                "code": decision.code.map(|c| c.as_str()),
            }));
            return (status, body).into_response();
        }

        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found"),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "Invalid signature"),
            ApiError::Database(msg) => {
                tracing::error!(error = %msg, "Database query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
            ApiError::Internal | ApiError::AccessDenied(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailtide_billing::DenyCode;

    #[test]
    fn test_payment_states_map_to_402() {
        for code in [
            DenyCode::SubscriptionExpired,
            DenyCode::PaymentPastDue,
            DenyCode::SubscriptionCanceled,
        ] {
            let decision = AccessDecision::denied(code, "denied".to_string());
            assert_eq!(deny_status(&decision), StatusCode::PAYMENT_REQUIRED);
        }
    }

    #[test]
    fn test_feature_and_limit_states_map_to_403() {
        for code in [
            DenyCode::FeatureNotAvailable,
            DenyCode::ContactLimitReached,
            DenyCode::CampaignLimitReached,
            DenyCode::EmailLimitReached,
            DenyCode::TemplateLimitReached,
            DenyCode::DomainLimitReached,
        ] {
            let decision = AccessDecision::denied(code, "denied".to_string());
            assert_eq!(deny_status(&decision), StatusCode::FORBIDDEN);
        }
    }

    #[test]
    fn test_billing_error_mapping() {
        let e: ApiError = BillingError::UnresolvedTarget("organization x".to_string()).into();
        assert!(matches!(e, ApiError::NotFound));

        let e: ApiError = BillingError::SignatureRejected("stale".to_string()).into();
        assert!(matches!(e, ApiError::InvalidSignature));

        let e: ApiError = BillingError::InvalidInput("bad".to_string()).into();
        assert!(matches!(e, ApiError::Validation(_)));
    }
}
