//! Entitlement middleware for Axum
//!
//! Every mutating request under `/api` passes the gate before its handler
//! runs. The subscription routes themselves are exempt so an expired
//! customer can still reach the pages that let them pay.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use mailtide_billing::{AccessDecision, FeatureFlag};
use mailtide_shared::types::ResourceKind;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the tenant identity. Resolving a user to an organization
/// is the auth layer's job; by the time requests reach this service the org
/// id is explicit.
pub const ORG_HEADER: &str = "x-organization-id";

/// What the gate checks for a given route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateCheck {
    /// No entitlement check at all.
    Exempt,
    /// Subscription must be usable; no feature or limit involved.
    SubscriptionOnly,
    /// Subscription plus a feature flag and/or a resource limit.
    Guarded {
        resource: Option<ResourceKind>,
        feature: Option<FeatureFlag>,
    },
}

fn is_collection_create(method: &Method, path: &str, base: &str) -> bool {
    method == Method::POST && path == base
}

/// Classify a request. Creation endpoints check the matching resource limit;
/// campaign creation additionally requires the campaigns feature. Everything
/// else under `/api` only needs a usable subscription.
pub fn classify(method: &Method, path: &str) -> GateCheck {
    if !path.starts_with("/api") {
        return GateCheck::Exempt;
    }
    if path == "/api/subscription" || path.starts_with("/api/subscription/") {
        return GateCheck::Exempt;
    }

    if is_collection_create(method, path, "/api/contacts") {
        return GateCheck::Guarded {
            resource: Some(ResourceKind::Contacts),
            feature: None,
        };
    }
    if is_collection_create(method, path, "/api/campaigns") {
        return GateCheck::Guarded {
            resource: Some(ResourceKind::Campaigns),
            feature: Some(FeatureFlag::EmailCampaigns),
        };
    }
    if is_collection_create(method, path, "/api/templates") {
        return GateCheck::Guarded {
            resource: Some(ResourceKind::Templates),
            feature: None,
        };
    }
    if is_collection_create(method, path, "/api/domains") {
        return GateCheck::Guarded {
            resource: Some(ResourceKind::Domains),
            feature: None,
        };
    }

    GateCheck::SubscriptionOnly
}

/// Pull the organization id out of the tenancy header.
pub fn org_id_from_headers(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get(ORG_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation(format!("{ORG_HEADER} header required")))?;
    raw.parse()
        .map_err(|_| ApiError::Validation(format!("{ORG_HEADER} must be a UUID")))
}

async fn evaluate(
    state: &AppState,
    org_id: Uuid,
    check: GateCheck,
) -> Result<AccessDecision, ApiError> {
    match check {
        GateCheck::Exempt => Ok(AccessDecision::granted()),
        GateCheck::SubscriptionOnly => {
            Ok(state.billing.entitlements.check_subscription(org_id).await?)
        }
        GateCheck::Guarded { resource, feature } => {
            if let Some(flag) = feature {
                let decision = state.billing.entitlements.check_feature(org_id, flag).await?;
                if !decision.allowed {
                    return Ok(decision);
                }
            }
            match resource {
                Some(kind) => Ok(state.billing.entitlements.check_resource(org_id, kind).await?),
                None => Ok(state.billing.entitlements.check_subscription(org_id).await?),
            }
        }
    }
}

/// Middleware that enforces entitlements on the `/api` tree.
pub async fn entitlement_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let check = classify(request.method(), request.uri().path());
    if check == GateCheck::Exempt {
        return next.run(request).await;
    }

    let org_id = match org_id_from_headers(request.headers()) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match evaluate(&state, org_id, check).await {
        Ok(decision) if decision.allowed => next.run(request).await,
        Ok(decision) => {
            tracing::info!(
                org_id = %org_id,
                path = request.uri().path(),
                code = ?decision.code,
                "Request denied by entitlement gate"
            );
            ApiError::AccessDenied(decision).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_routes_exempt() {
        assert_eq!(classify(&Method::GET, "/api/subscription"), GateCheck::Exempt);
        assert_eq!(
            classify(&Method::POST, "/api/subscription/manage"),
            GateCheck::Exempt
        );
        assert_eq!(
            classify(&Method::GET, "/api/subscription/usage"),
            GateCheck::Exempt
        );
    }

    #[test]
    fn test_non_api_paths_exempt() {
        assert_eq!(classify(&Method::POST, "/webhooks/billing"), GateCheck::Exempt);
        assert_eq!(classify(&Method::GET, "/health"), GateCheck::Exempt);
    }

    #[test]
    fn test_creation_endpoints_check_limits() {
        assert_eq!(
            classify(&Method::POST, "/api/contacts"),
            GateCheck::Guarded {
                resource: Some(ResourceKind::Contacts),
                feature: None,
            }
        );
        assert_eq!(
            classify(&Method::POST, "/api/campaigns"),
            GateCheck::Guarded {
                resource: Some(ResourceKind::Campaigns),
                feature: Some(FeatureFlag::EmailCampaigns),
            }
        );
        assert_eq!(
            classify(&Method::POST, "/api/domains"),
            GateCheck::Guarded {
                resource: Some(ResourceKind::Domains),
                feature: None,
            }
        );
    }

    #[test]
    fn test_reads_and_subpaths_need_subscription_only() {
        assert_eq!(
            classify(&Method::GET, "/api/contacts"),
            GateCheck::SubscriptionOnly
        );
        // Acting on an existing campaign is not a creation
        assert_eq!(
            classify(&Method::POST, "/api/campaigns/42/send"),
            GateCheck::SubscriptionOnly
        );
        assert_eq!(
            classify(&Method::DELETE, "/api/templates/7"),
            GateCheck::SubscriptionOnly
        );
    }

    #[test]
    fn test_org_header_parsing() {
        let mut headers = HeaderMap::new();
        assert!(org_id_from_headers(&headers).is_err());

        headers.insert(ORG_HEADER, "not-a-uuid".parse().unwrap());
        assert!(org_id_from_headers(&headers).is_err());

        let id = Uuid::new_v4();
        headers.insert(ORG_HEADER, id.to_string().parse().unwrap());
        assert_eq!(org_id_from_headers(&headers).unwrap(), id);
    }
}
