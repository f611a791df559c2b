// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Lifecycle
//!
//! Boundary conditions that cut across modules:
//! - Entitlement gate at exact expiry instants
//! - Resource limits at and around the threshold
//! - Sweep day arithmetic and reminder windows
//! - Webhook signature tolerance boundaries
//! - Expiry classification precedence
//! - Plan catalog pricing and tier ordering

#[cfg(test)]
mod gate_boundary_tests {
    use crate::entitlement::{subscription_active, subscription_gate, DenyCode};
    use crate::subscriptions::Organization;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn org(plan: &str, status: &str) -> Organization {
        let now = OffsetDateTime::now_utc();
        Organization {
            id: Uuid::new_v4(),
            name: "Edge Org".to_string(),
            plan: plan.to_string(),
            status: status.to_string(),
            billing_cycle: "monthly".to_string(),
            trial_ends_at: None,
            period_ends_at: None,
            cancel_at_period_end: false,
            is_active: true,
            processor_customer_ref: None,
            processor_subscription_ref: None,
            processor_price_ref: None,
            contacts_limit: 25_000,
            campaigns_limit: 200,
            emails_per_month_limit: 250_000,
            pending_plan: None,
            pending_plan_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    // =========================================================================
    // Expiry at the exact instant: period_ends_at == now counts as lapsed
    // =========================================================================
    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let now = OffsetDateTime::now_utc();
        let mut o = org("pro_monthly", "active");
        o.period_ends_at = Some(now);

        assert_eq!(
            subscription_gate(&o, now),
            Err(DenyCode::SubscriptionExpired)
        );

        // One second earlier is still inside the period
        o.period_ends_at = Some(now + Duration::seconds(1));
        assert!(subscription_gate(&o, now).is_ok());
    }

    // =========================================================================
    // Trial plan reads trial_ends_at even if period_ends_at is stale
    // =========================================================================
    #[test]
    fn test_trial_plan_ignores_period_end() {
        let now = OffsetDateTime::now_utc();
        let mut o = org("free_trial", "trialing");
        o.trial_ends_at = Some(now + Duration::days(5));
        o.period_ends_at = Some(now - Duration::days(30));

        assert!(subscription_active(&o, now));
    }

    // =========================================================================
    // Paid plan reads period_ends_at even if a stale trial date lingers
    // =========================================================================
    #[test]
    fn test_paid_plan_ignores_trial_end() {
        let now = OffsetDateTime::now_utc();
        let mut o = org("basic_monthly", "active");
        o.trial_ends_at = Some(now - Duration::days(30));
        o.period_ends_at = Some(now + Duration::days(20));

        assert!(subscription_active(&o, now));
    }

    // =========================================================================
    // past_due inside the grace window passes; past the window it does not
    // =========================================================================
    #[test]
    fn test_grace_window_boundary() {
        let now = OffsetDateTime::now_utc();
        let mut o = org("pro_monthly", "past_due");

        o.period_ends_at = Some(now + Duration::seconds(1));
        assert!(subscription_gate(&o, now).is_ok());

        o.period_ends_at = Some(now);
        assert_eq!(subscription_gate(&o, now), Err(DenyCode::PaymentPastDue));
    }

    // =========================================================================
    // Canceled denies even with a future period end
    // =========================================================================
    #[test]
    fn test_canceled_denies_despite_future_period() {
        let now = OffsetDateTime::now_utc();
        let mut o = org("premium_yearly", "canceled");
        o.period_ends_at = Some(now + Duration::days(300));

        assert_eq!(
            subscription_gate(&o, now),
            Err(DenyCode::SubscriptionCanceled)
        );
    }

    // =========================================================================
    // Unrecognized status string reads as canceled (fail closed)
    // =========================================================================
    #[test]
    fn test_unknown_status_fails_closed() {
        let now = OffsetDateTime::now_utc();
        let mut o = org("pro_monthly", "incomplete");
        o.period_ends_at = Some(now + Duration::days(20));

        assert_eq!(
            subscription_gate(&o, now),
            Err(DenyCode::SubscriptionCanceled)
        );
    }
}

#[cfg(test)]
mod limit_boundary_tests {
    use crate::entitlement::check_limit;
    use mailtide_shared::types::ResourceKind;

    // =========================================================================
    // current == limit - 1 allowed, current == limit denied (strict less-than)
    // =========================================================================
    #[test]
    fn test_limit_threshold_is_strict() {
        assert!(check_limit(ResourceKind::Campaigns, 49, Some(50)).allowed);
        assert!(!check_limit(ResourceKind::Campaigns, 50, Some(50)).allowed);
        assert!(!check_limit(ResourceKind::Campaigns, 51, Some(50)).allowed);
    }

    // =========================================================================
    // Zero limit denies everything and reports no percentage
    // =========================================================================
    #[test]
    fn test_zero_limit_denies_all() {
        let check = check_limit(ResourceKind::Domains, 0, Some(0));
        assert!(!check.allowed);
        assert!(check.percent_used.is_none());
    }

    // =========================================================================
    // No limit always allows, regardless of the counter
    // =========================================================================
    #[test]
    fn test_unlimited_always_allows() {
        let check = check_limit(ResourceKind::Templates, i64::MAX, None);
        assert!(check.allowed);
        assert!(check.percent_used.is_none());
    }

    // =========================================================================
    // Percentage at the warning threshold: 8999/10000 is below, 9000 is at
    // =========================================================================
    #[test]
    fn test_percentage_at_warning_threshold() {
        let below = check_limit(ResourceKind::Emails, 8_999, Some(10_000));
        let at = check_limit(ResourceKind::Emails, 9_000, Some(10_000));

        assert!(below.percent_used.unwrap() < 90.0);
        assert!(at.percent_used.unwrap() >= 90.0);
        assert!(at.allowed, "90% used is warned, not blocked");
    }
}

#[cfg(test)]
mod sweep_window_tests {
    use crate::sweep::days_remaining;
    use time::{Duration, OffsetDateTime};

    // =========================================================================
    // Exact day multiples stay exact; one extra second rounds up
    // =========================================================================
    #[test]
    fn test_days_remaining_rounds_up() {
        let now = OffsetDateTime::now_utc();

        assert_eq!(days_remaining(now + Duration::days(7), now), 7);
        assert_eq!(days_remaining(now + Duration::days(7) + Duration::seconds(1), now), 8);
        assert_eq!(days_remaining(now + Duration::seconds(1), now), 1);
    }

    // =========================================================================
    // A deadline in the past or right now reports zero, never negative
    // =========================================================================
    #[test]
    fn test_days_remaining_floors_at_zero() {
        let now = OffsetDateTime::now_utc();

        assert_eq!(days_remaining(now, now), 0);
        assert_eq!(days_remaining(now - Duration::days(3), now), 0);
    }

    // =========================================================================
    // Reminder offsets: only the configured day counts fire
    // =========================================================================
    #[test]
    fn test_reminder_offsets_match_configured_days() {
        let trial_days: Vec<i64> = vec![7, 1];
        let now = OffsetDateTime::now_utc();

        for days in [7_i64, 1] {
            let remaining = days_remaining(now + Duration::days(days), now);
            assert!(trial_days.contains(&remaining), "day {days} should fire");
        }
        for days in [6_i64, 2, 8] {
            let remaining = days_remaining(now + Duration::days(days), now);
            assert!(!trial_days.contains(&remaining), "day {days} should not fire");
        }
    }
}

#[cfg(test)]
mod signature_boundary_tests {
    use crate::webhooks::{compute_signature, verify_signature};

    const SECRET: &str = "whsec_boundary";
    const TOLERANCE: i64 = 300;

    fn header_for(timestamp: i64, payload: &str) -> String {
        let sig = compute_signature(SECRET, timestamp, payload).expect("sign");
        format!("t={timestamp},v1={sig}")
    }

    // =========================================================================
    // Skew of exactly the tolerance passes; one second more is rejected
    // =========================================================================
    #[test]
    fn test_tolerance_boundary() {
        let payload = r#"{"id":"evt_boundary"}"#;
        let sent_at = 1_700_000_000_i64;

        let header = header_for(sent_at, payload);
        assert!(verify_signature(SECRET, &header, payload, sent_at + TOLERANCE, TOLERANCE).is_ok());
        assert!(
            verify_signature(SECRET, &header, payload, sent_at + TOLERANCE + 1, TOLERANCE).is_err()
        );
    }

    // =========================================================================
    // Clock skew in the other direction is bounded the same way
    // =========================================================================
    #[test]
    fn test_future_timestamp_boundary() {
        let payload = r#"{"id":"evt_future"}"#;
        let sent_at = 1_700_000_000_i64;

        let header = header_for(sent_at, payload);
        assert!(verify_signature(SECRET, &header, payload, sent_at - TOLERANCE, TOLERANCE).is_ok());
        assert!(
            verify_signature(SECRET, &header, payload, sent_at - TOLERANCE - 1, TOLERANCE).is_err()
        );
    }

    // =========================================================================
    // A signature for one body never validates another, even with same length
    // =========================================================================
    #[test]
    fn test_signature_bound_to_exact_body() {
        let sent_at = 1_700_000_000_i64;
        let header = header_for(sent_at, r#"{"amount":100}"#);

        assert!(verify_signature(SECRET, &header, r#"{"amount":900}"#, sent_at, TOLERANCE).is_err());
    }

    // =========================================================================
    // The timestamp is part of the signed material, not just the header
    // =========================================================================
    #[test]
    fn test_timestamp_substitution_rejected() {
        let payload = r#"{"id":"evt_replay"}"#;
        let sent_at = 1_700_000_000_i64;

        // Take a valid signature, present it under a fresher timestamp
        let sig = compute_signature(SECRET, sent_at, payload).expect("sign");
        let forged = format!("t={},v1={}", sent_at + 100, sig);

        assert!(verify_signature(SECRET, &forged, payload, sent_at + 100, TOLERANCE).is_err());
    }
}

#[cfg(test)]
mod expiry_classification_tests {
    use crate::subscriptions::{expiry_kind_for, ExpiryKind, Organization};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn lapsed_org(plan: &str, status: &str) -> Organization {
        let now = OffsetDateTime::now_utc();
        Organization {
            id: Uuid::new_v4(),
            name: "Lapsed Org".to_string(),
            plan: plan.to_string(),
            status: status.to_string(),
            billing_cycle: "monthly".to_string(),
            trial_ends_at: Some(now - Duration::days(1)),
            period_ends_at: Some(now - Duration::days(1)),
            cancel_at_period_end: false,
            is_active: true,
            processor_customer_ref: None,
            processor_subscription_ref: None,
            processor_price_ref: None,
            contacts_limit: 5_000,
            campaigns_limit: 50,
            emails_per_month_limit: 50_000,
            pending_plan: None,
            pending_plan_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    // =========================================================================
    // The cancel-at-period-end flag wins over plain subscription expiry
    // =========================================================================
    #[test]
    fn test_cancel_flag_takes_precedence() {
        let now = OffsetDateTime::now_utc();
        let mut o = lapsed_org("pro_monthly", "active");

        assert_eq!(expiry_kind_for(&o, now), Some(ExpiryKind::Subscription));

        o.cancel_at_period_end = true;
        assert_eq!(expiry_kind_for(&o, now), Some(ExpiryKind::CanceledReset));
    }

    // =========================================================================
    // Already-canceled organizations are never classified again
    // =========================================================================
    #[test]
    fn test_canceled_org_never_expires_again() {
        let now = OffsetDateTime::now_utc();
        let o = lapsed_org("pro_monthly", "canceled");

        assert_eq!(expiry_kind_for(&o, now), None);
    }

    // =========================================================================
    // past_due beyond its grace window classifies as subscription expiry
    // =========================================================================
    #[test]
    fn test_past_due_beyond_grace_expires() {
        let now = OffsetDateTime::now_utc();
        let o = lapsed_org("basic_monthly", "past_due");

        assert_eq!(expiry_kind_for(&o, now), Some(ExpiryKind::Subscription));
    }
}

#[cfg(test)]
mod catalog_pricing_tests {
    use crate::catalog::{PlanCatalog, PlanDefinition};
    use mailtide_shared::types::{BillingCycle, PlanId};

    // =========================================================================
    // Yearly cycles charge ten monthly prices (two months free)
    // =========================================================================
    #[test]
    fn test_yearly_price_is_ten_monthly() {
        for (monthly, yearly) in [
            (
                PlanDefinition::basic(BillingCycle::Monthly),
                PlanDefinition::basic(BillingCycle::Yearly),
            ),
            (
                PlanDefinition::pro(BillingCycle::Monthly),
                PlanDefinition::pro(BillingCycle::Yearly),
            ),
            (
                PlanDefinition::premium(BillingCycle::Monthly),
                PlanDefinition::premium(BillingCycle::Yearly),
            ),
        ] {
            assert_eq!(yearly.price_cents, monthly.price_cents * 10);
        }
    }

    // =========================================================================
    // Cycle never affects tier: pro_yearly -> basic_monthly is a downgrade,
    // basic_monthly -> basic_yearly is not
    // =========================================================================
    #[test]
    fn test_downgrade_ignores_cycle() {
        assert!(PlanCatalog::is_downgrade(
            PlanId::ProYearly,
            PlanId::BasicMonthly
        ));
        assert!(!PlanCatalog::is_downgrade(
            PlanId::BasicMonthly,
            PlanId::BasicYearly
        ));
        assert!(!PlanCatalog::is_downgrade(
            PlanId::BasicMonthly,
            PlanId::PremiumYearly
        ));
    }

    // =========================================================================
    // Limits grow monotonically with tier for every metered resource
    // =========================================================================
    #[test]
    fn test_limits_grow_with_tier() {
        let trial = PlanDefinition::free_trial();
        let basic = PlanDefinition::basic(BillingCycle::Monthly);
        let pro = PlanDefinition::pro(BillingCycle::Monthly);
        let premium = PlanDefinition::premium(BillingCycle::Monthly);

        let ladder = [&trial, &basic, &pro, &premium];
        for pair in ladder.windows(2) {
            assert!(pair[0].contacts_limit < pair[1].contacts_limit);
            assert!(pair[0].emails_per_month_limit < pair[1].emails_per_month_limit);
        }
    }
}
