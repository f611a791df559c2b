//! Core billing domain types shared across crates.
//!
//! All enums serialize as snake_case strings and round-trip through their
//! `as_str`/`FromStr` pair, which is also the form stored in Postgres TEXT
//! columns.

use serde::{Deserialize, Serialize};

/// Billing plan identifier. Encodes both tier and billing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    FreeTrial,
    BasicMonthly,
    BasicYearly,
    ProMonthly,
    ProYearly,
    PremiumMonthly,
    PremiumYearly,
}

impl PlanId {
    pub const ALL: [PlanId; 7] = [
        PlanId::FreeTrial,
        PlanId::BasicMonthly,
        PlanId::BasicYearly,
        PlanId::ProMonthly,
        PlanId::ProYearly,
        PlanId::PremiumMonthly,
        PlanId::PremiumYearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanId::FreeTrial => "free_trial",
            PlanId::BasicMonthly => "basic_monthly",
            PlanId::BasicYearly => "basic_yearly",
            PlanId::ProMonthly => "pro_monthly",
            PlanId::ProYearly => "pro_yearly",
            PlanId::PremiumMonthly => "premium_monthly",
            PlanId::PremiumYearly => "premium_yearly",
        }
    }

    /// The trial plan never has a billing cycle in the payment processor;
    /// it is reported as monthly for display purposes.
    pub fn billing_cycle(&self) -> BillingCycle {
        match self {
            PlanId::BasicYearly | PlanId::ProYearly | PlanId::PremiumYearly => BillingCycle::Yearly,
            _ => BillingCycle::Monthly,
        }
    }

    pub fn is_trial(&self) -> bool {
        matches!(self, PlanId::FreeTrial)
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlanId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free_trial" => Ok(PlanId::FreeTrial),
            "basic_monthly" => Ok(PlanId::BasicMonthly),
            "basic_yearly" => Ok(PlanId::BasicYearly),
            "pro_monthly" => Ok(PlanId::ProMonthly),
            "pro_yearly" => Ok(PlanId::ProYearly),
            "premium_monthly" => Ok(PlanId::PremiumMonthly),
            "premium_yearly" => Ok(PlanId::PremiumYearly),
            _ => Err(format!("unknown plan: {}", s)),
        }
    }
}

/// How often a paid plan bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            _ => Err(format!("unknown billing cycle: {}", s)),
        }
    }
}

/// Organization subscription status.
///
/// `PastDue` keeps access until the grace window runs out; the entitlement
/// checks decide that from the period timestamps, not from this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            _ => Err(format!("unknown subscription status: {}", s)),
        }
    }
}

/// A trackable resource type.
///
/// Stock resources (contacts, campaigns, templates, domains) are enforced
/// against live row counts because they can be deleted and re-created. Flow
/// resources (emails and the rest) are enforced against the monthly counters
/// because their history matters for billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Contacts,
    Campaigns,
    Emails,
    Templates,
    Domains,
    ApiCalls,
    AbTests,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Contacts => "contacts",
            ResourceKind::Campaigns => "campaigns",
            ResourceKind::Emails => "emails",
            ResourceKind::Templates => "templates",
            ResourceKind::Domains => "domains",
            ResourceKind::ApiCalls => "api_calls",
            ResourceKind::AbTests => "ab_tests",
        }
    }

    /// Column on `usage_records` incremented for this resource.
    pub fn counter_column(&self) -> &'static str {
        match self {
            ResourceKind::Contacts => "contacts_imported",
            ResourceKind::Campaigns => "campaigns_created",
            ResourceKind::Emails => "emails_sent",
            ResourceKind::Templates => "templates_created",
            ResourceKind::Domains => "domains_verified",
            ResourceKind::ApiCalls => "api_calls",
            ResourceKind::AbTests => "ab_tests_created",
        }
    }

    /// Stock resources are limit-checked against live counts, not counters.
    pub fn is_stock(&self) -> bool {
        matches!(
            self,
            ResourceKind::Contacts
                | ResourceKind::Campaigns
                | ResourceKind::Templates
                | ResourceKind::Domains
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contacts" => Ok(ResourceKind::Contacts),
            "campaigns" => Ok(ResourceKind::Campaigns),
            "emails" => Ok(ResourceKind::Emails),
            "templates" => Ok(ResourceKind::Templates),
            "domains" => Ok(ResourceKind::Domains),
            "api_calls" => Ok(ResourceKind::ApiCalls),
            "ab_tests" => Ok(ResourceKind::AbTests),
            _ => Err(format!("unknown resource kind: {}", s)),
        }
    }
}

/// Kind of a subscription transition history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Created,
    Updated,
    Canceled,
    Renewed,
    PaymentSucceeded,
    PaymentFailed,
    TrialStarted,
    TrialEnded,
    PlanChanged,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Created => "created",
            TransitionKind::Updated => "updated",
            TransitionKind::Canceled => "canceled",
            TransitionKind::Renewed => "renewed",
            TransitionKind::PaymentSucceeded => "payment_succeeded",
            TransitionKind::PaymentFailed => "payment_failed",
            TransitionKind::TrialStarted => "trial_started",
            TransitionKind::TrialEnded => "trial_ended",
            TransitionKind::PlanChanged => "plan_changed",
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransitionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TransitionKind::Created),
            "updated" => Ok(TransitionKind::Updated),
            "canceled" => Ok(TransitionKind::Canceled),
            "renewed" => Ok(TransitionKind::Renewed),
            "payment_succeeded" => Ok(TransitionKind::PaymentSucceeded),
            "payment_failed" => Ok(TransitionKind::PaymentFailed),
            "trial_started" => Ok(TransitionKind::TrialStarted),
            "trial_ended" => Ok(TransitionKind::TrialEnded),
            "plan_changed" => Ok(TransitionKind::PlanChanged),
            _ => Err(format!("unknown transition kind: {}", s)),
        }
    }
}

/// Kind of a customer-visible notification event.
///
/// The billing core only records these and forwards them to the dispatch
/// callback; rendering and delivery live elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TrialEndingSoon,
    TrialExpired,
    SubscriptionEndingSoon,
    SubscriptionActivated,
    SubscriptionCanceled,
    SubscriptionExpired,
    PaymentSucceeded,
    PaymentFailed,
    PlanChanged,
    UsageWarning,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TrialEndingSoon => "trial_ending_soon",
            NotificationKind::TrialExpired => "trial_expired",
            NotificationKind::SubscriptionEndingSoon => "subscription_ending_soon",
            NotificationKind::SubscriptionActivated => "subscription_activated",
            NotificationKind::SubscriptionCanceled => "subscription_canceled",
            NotificationKind::SubscriptionExpired => "subscription_expired",
            NotificationKind::PaymentSucceeded => "payment_succeeded",
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::PlanChanged => "plan_changed",
            NotificationKind::UsageWarning => "usage_warning",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial_ending_soon" => Ok(NotificationKind::TrialEndingSoon),
            "trial_expired" => Ok(NotificationKind::TrialExpired),
            "subscription_ending_soon" => Ok(NotificationKind::SubscriptionEndingSoon),
            "subscription_activated" => Ok(NotificationKind::SubscriptionActivated),
            "subscription_canceled" => Ok(NotificationKind::SubscriptionCanceled),
            "subscription_expired" => Ok(NotificationKind::SubscriptionExpired),
            "payment_succeeded" => Ok(NotificationKind::PaymentSucceeded),
            "payment_failed" => Ok(NotificationKind::PaymentFailed),
            "plan_changed" => Ok(NotificationKind::PlanChanged),
            "usage_warning" => Ok(NotificationKind::UsageWarning),
            _ => Err(format!("unknown notification kind: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_id_round_trip() {
        for plan in PlanId::ALL {
            let parsed: PlanId = plan.as_str().parse().expect("round trip");
            assert_eq!(parsed, plan);
        }
    }

    #[test]
    fn test_plan_billing_cycles() {
        assert_eq!(PlanId::FreeTrial.billing_cycle(), BillingCycle::Monthly);
        assert_eq!(PlanId::BasicMonthly.billing_cycle(), BillingCycle::Monthly);
        assert_eq!(PlanId::BasicYearly.billing_cycle(), BillingCycle::Yearly);
        assert_eq!(PlanId::PremiumYearly.billing_cycle(), BillingCycle::Yearly);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SubscriptionStatus::PastDue.to_string(), "past_due");
        assert_eq!(SubscriptionStatus::Trialing.to_string(), "trialing");
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!("suspended".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_counter_columns() {
        assert_eq!(ResourceKind::Emails.counter_column(), "emails_sent");
        assert_eq!(ResourceKind::Contacts.counter_column(), "contacts_imported");
        assert_eq!(ResourceKind::Domains.counter_column(), "domains_verified");
    }

    #[test]
    fn test_stock_vs_flow() {
        assert!(ResourceKind::Contacts.is_stock());
        assert!(ResourceKind::Templates.is_stock());
        assert!(!ResourceKind::Emails.is_stock());
        assert!(!ResourceKind::ApiCalls.is_stock());
    }

    #[test]
    fn test_notification_kind_serde_form() {
        let json = serde_json::to_string(&NotificationKind::UsageWarning).expect("serialize");
        assert_eq!(json, "\"usage_warning\"");
    }
}
