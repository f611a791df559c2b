//! Billing webhook endpoint
//!
//! One POST route receiving the payment processor's signed events. The body
//! stays raw bytes until the signature passes; all parsing happens inside
//! the billing crate's handler.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Signature header set by the processor on every delivery.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::InvalidSignature)?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::Validation("webhook body must be UTF-8".to_string()))?;

    let outcome = state.billing.webhooks.handle(payload, signature).await?;

    Ok(Json(json!({ "status": outcome.as_str() })))
}
