//! Plan Catalog
//!
//! Immutable lookup table from plan identifier to price, resource limits, and
//! feature flags. Built once at startup from the builtin definitions plus the
//! configured processor price references, injected behind an `Arc`, and never
//! mutated afterwards. Both webhook plan resolution and the entitlement gate
//! read from here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mailtide_shared::types::{BillingCycle, PlanId, ResourceKind};

/// Capability flags attached to a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeatures {
    pub email_campaigns: bool,
    pub basic_analytics: bool,
    pub advanced_analytics: bool,
    pub ab_testing: bool,
    pub automation: bool,
    pub custom_templates: bool,
    pub white_labeling: bool,
    pub api_access: bool,
    pub priority_support: bool,
}

impl PlanFeatures {
    /// Minimal set applied when an organization's plan cannot be resolved.
    /// Restrictive-but-usable: campaigns and basic analytics only.
    pub fn minimal() -> Self {
        Self {
            email_campaigns: true,
            basic_analytics: true,
            advanced_analytics: false,
            ab_testing: false,
            automation: false,
            custom_templates: false,
            white_labeling: false,
            api_access: false,
            priority_support: false,
        }
    }

    pub fn has(&self, flag: FeatureFlag) -> bool {
        match flag {
            FeatureFlag::EmailCampaigns => self.email_campaigns,
            FeatureFlag::BasicAnalytics => self.basic_analytics,
            FeatureFlag::AdvancedAnalytics => self.advanced_analytics,
            FeatureFlag::AbTesting => self.ab_testing,
            FeatureFlag::Automation => self.automation,
            FeatureFlag::CustomTemplates => self.custom_templates,
            FeatureFlag::WhiteLabeling => self.white_labeling,
            FeatureFlag::ApiAccess => self.api_access,
            FeatureFlag::PrioritySupport => self.priority_support,
        }
    }

    /// The flags this set grants, in declaration order.
    pub fn enabled(&self) -> Vec<FeatureFlag> {
        FeatureFlag::ALL
            .iter()
            .copied()
            .filter(|flag| self.has(*flag))
            .collect()
    }
}

/// A named capability the entitlement gate can check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlag {
    EmailCampaigns,
    BasicAnalytics,
    AdvancedAnalytics,
    AbTesting,
    Automation,
    CustomTemplates,
    WhiteLabeling,
    ApiAccess,
    PrioritySupport,
}

impl FeatureFlag {
    pub const ALL: [FeatureFlag; 9] = [
        FeatureFlag::EmailCampaigns,
        FeatureFlag::BasicAnalytics,
        FeatureFlag::AdvancedAnalytics,
        FeatureFlag::AbTesting,
        FeatureFlag::Automation,
        FeatureFlag::CustomTemplates,
        FeatureFlag::WhiteLabeling,
        FeatureFlag::ApiAccess,
        FeatureFlag::PrioritySupport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureFlag::EmailCampaigns => "email_campaigns",
            FeatureFlag::BasicAnalytics => "basic_analytics",
            FeatureFlag::AdvancedAnalytics => "advanced_analytics",
            FeatureFlag::AbTesting => "ab_testing",
            FeatureFlag::Automation => "automation",
            FeatureFlag::CustomTemplates => "custom_templates",
            FeatureFlag::WhiteLabeling => "white_labeling",
            FeatureFlag::ApiAccess => "api_access",
            FeatureFlag::PrioritySupport => "priority_support",
        }
    }
}

impl std::fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FeatureFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_campaigns" => Ok(FeatureFlag::EmailCampaigns),
            "basic_analytics" => Ok(FeatureFlag::BasicAnalytics),
            "advanced_analytics" => Ok(FeatureFlag::AdvancedAnalytics),
            "ab_testing" => Ok(FeatureFlag::AbTesting),
            "automation" => Ok(FeatureFlag::Automation),
            "custom_templates" => Ok(FeatureFlag::CustomTemplates),
            "white_labeling" => Ok(FeatureFlag::WhiteLabeling),
            "api_access" => Ok(FeatureFlag::ApiAccess),
            "priority_support" => Ok(FeatureFlag::PrioritySupport),
            _ => Err(format!("unknown feature flag: {}", s)),
        }
    }
}

/// One plan's price, limits, and capabilities. `None` limits are unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub id: PlanId,
    pub display_name: &'static str,
    /// Price per billing cycle, in cents. Yearly plans charge ten monthly
    /// prices per cycle (two months free).
    pub price_cents: i64,
    pub contacts_limit: i64,
    pub campaigns_limit: i64,
    pub emails_per_month_limit: i64,
    pub templates_limit: Option<i64>,
    pub domains_limit: Option<i64>,
    pub features: PlanFeatures,
}

impl PlanDefinition {
    /// Free trial: 1,000 contacts, 10 campaigns, 10,000 emails/month.
    pub fn free_trial() -> Self {
        Self {
            id: PlanId::FreeTrial,
            display_name: "Free Trial",
            price_cents: 0,
            contacts_limit: 1_000,
            campaigns_limit: 10,
            emails_per_month_limit: 10_000,
            templates_limit: Some(50),
            domains_limit: Some(3),
            features: PlanFeatures::minimal(),
        }
    }

    /// Basic: $29/month, 5,000 contacts, 50 campaigns, 50,000 emails/month.
    pub fn basic(cycle: BillingCycle) -> Self {
        Self {
            id: match cycle {
                BillingCycle::Monthly => PlanId::BasicMonthly,
                BillingCycle::Yearly => PlanId::BasicYearly,
            },
            display_name: "Basic",
            price_cents: cycle_price(2_900, cycle),
            contacts_limit: 5_000,
            campaigns_limit: 50,
            emails_per_month_limit: 50_000,
            templates_limit: Some(10),
            domains_limit: Some(1),
            features: PlanFeatures {
                ab_testing: true,
                ..PlanFeatures::minimal()
            },
        }
    }

    /// Pro: $79/month, 25,000 contacts, 200 campaigns, 250,000 emails/month,
    /// unlimited templates.
    pub fn pro(cycle: BillingCycle) -> Self {
        Self {
            id: match cycle {
                BillingCycle::Monthly => PlanId::ProMonthly,
                BillingCycle::Yearly => PlanId::ProYearly,
            },
            display_name: "Pro",
            price_cents: cycle_price(7_900, cycle),
            contacts_limit: 25_000,
            campaigns_limit: 200,
            emails_per_month_limit: 250_000,
            templates_limit: None,
            domains_limit: Some(3),
            features: PlanFeatures {
                advanced_analytics: true,
                ab_testing: true,
                automation: true,
                custom_templates: true,
                api_access: true,
                ..PlanFeatures::minimal()
            },
        }
    }

    /// Premium: $149/month, 100,000 contacts, 1,000 campaigns, 1M emails/month,
    /// unlimited templates and domains.
    pub fn premium(cycle: BillingCycle) -> Self {
        Self {
            id: match cycle {
                BillingCycle::Monthly => PlanId::PremiumMonthly,
                BillingCycle::Yearly => PlanId::PremiumYearly,
            },
            display_name: "Premium",
            price_cents: cycle_price(14_900, cycle),
            contacts_limit: 100_000,
            campaigns_limit: 1_000,
            emails_per_month_limit: 1_000_000,
            templates_limit: None,
            domains_limit: None,
            features: PlanFeatures {
                advanced_analytics: true,
                ab_testing: true,
                automation: true,
                custom_templates: true,
                white_labeling: true,
                api_access: true,
                priority_support: true,
                ..PlanFeatures::minimal()
            },
        }
    }

    /// Limit for a resource under this plan. `None` means unlimited or
    /// untracked.
    pub fn limit_for(&self, resource: ResourceKind) -> Option<i64> {
        match resource {
            ResourceKind::Contacts => Some(self.contacts_limit),
            ResourceKind::Campaigns => Some(self.campaigns_limit),
            ResourceKind::Emails => Some(self.emails_per_month_limit),
            ResourceKind::Templates => self.templates_limit,
            ResourceKind::Domains => self.domains_limit,
            ResourceKind::ApiCalls | ResourceKind::AbTests => None,
        }
    }
}

fn cycle_price(monthly_cents: i64, cycle: BillingCycle) -> i64 {
    match cycle {
        BillingCycle::Monthly => monthly_cents,
        BillingCycle::Yearly => monthly_cents * 10,
    }
}

/// The injected catalog: every plan definition plus the processor price-ref
/// index used to resolve webhook payloads back to plans.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<PlanId, PlanDefinition>,
    price_refs: HashMap<String, PlanId>,
    trial: PlanDefinition,
}

impl PlanCatalog {
    pub fn new(price_refs: HashMap<String, PlanId>) -> Self {
        let mut plans = HashMap::new();
        for def in [
            PlanDefinition::free_trial(),
            PlanDefinition::basic(BillingCycle::Monthly),
            PlanDefinition::basic(BillingCycle::Yearly),
            PlanDefinition::pro(BillingCycle::Monthly),
            PlanDefinition::pro(BillingCycle::Yearly),
            PlanDefinition::premium(BillingCycle::Monthly),
            PlanDefinition::premium(BillingCycle::Yearly),
        ] {
            plans.insert(def.id, def);
        }
        Self {
            plans,
            price_refs,
            trial: PlanDefinition::free_trial(),
        }
    }

    pub fn get(&self, plan: PlanId) -> Option<&PlanDefinition> {
        self.plans.get(&plan)
    }

    /// Lookup that falls back to the trial definition (the most restrictive
    /// limits in the catalog) rather than failing open.
    pub fn get_or_trial(&self, plan: PlanId) -> &PlanDefinition {
        self.plans.get(&plan).unwrap_or(&self.trial)
    }

    pub fn trial(&self) -> &PlanDefinition {
        &self.trial
    }

    /// Resolve a plan from its stored string form; unknown strings get the
    /// trial fallback plus the minimal feature set.
    pub fn resolve_plan_str(&self, plan: &str) -> Option<&PlanDefinition> {
        plan.parse::<PlanId>().ok().and_then(|id| self.get(id))
    }

    /// Map a processor price reference to a plan. Unknown references return
    /// `None`; callers must treat that as "ignore, no mutation".
    pub fn resolve_price(&self, price_ref: &str) -> Option<PlanId> {
        self.price_refs.get(price_ref).copied()
    }

    /// Reverse lookup used when this side initiates a plan change.
    pub fn price_ref_for(&self, plan: PlanId) -> Option<&str> {
        self.price_refs
            .iter()
            .find(|(_, p)| **p == plan)
            .map(|(price_ref, _)| price_ref.as_str())
    }

    /// Tier ordering for upgrade/downgrade classification. Billing cycle does
    /// not affect rank: basic_yearly -> basic_monthly is a cycle change, not
    /// a downgrade.
    pub fn tier_rank(plan: PlanId) -> u8 {
        match plan {
            PlanId::FreeTrial => 0,
            PlanId::BasicMonthly | PlanId::BasicYearly => 1,
            PlanId::ProMonthly | PlanId::ProYearly => 2,
            PlanId::PremiumMonthly | PlanId::PremiumYearly => 3,
        }
    }

    pub fn is_downgrade(from: PlanId, to: PlanId) -> bool {
        Self::tier_rank(to) < Self::tier_rank(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PlanCatalog {
        let mut refs = HashMap::new();
        refs.insert("price_pro_m".to_string(), PlanId::ProMonthly);
        refs.insert("price_basic_y".to_string(), PlanId::BasicYearly);
        PlanCatalog::new(refs)
    }

    #[test]
    fn test_all_plans_present() {
        let catalog = catalog();
        for plan in PlanId::ALL {
            assert!(catalog.get(plan).is_some(), "missing {}", plan);
        }
    }

    #[test]
    fn test_yearly_price_is_ten_monthly() {
        let catalog = catalog();
        let monthly = catalog.get(PlanId::ProMonthly).expect("pro monthly");
        let yearly = catalog.get(PlanId::ProYearly).expect("pro yearly");
        assert_eq!(monthly.price_cents, 7_900);
        assert_eq!(yearly.price_cents, 79_000);
    }

    #[test]
    fn test_trial_limits() {
        let trial = PlanDefinition::free_trial();
        assert_eq!(trial.contacts_limit, 1_000);
        assert_eq!(trial.campaigns_limit, 10);
        assert_eq!(trial.emails_per_month_limit, 10_000);
        assert_eq!(trial.price_cents, 0);
    }

    #[test]
    fn test_feature_ladder() {
        let basic = PlanDefinition::basic(BillingCycle::Monthly);
        assert!(basic.features.email_campaigns);
        assert!(basic.features.ab_testing);
        assert!(!basic.features.advanced_analytics);
        assert!(!basic.features.api_access);

        let pro = PlanDefinition::pro(BillingCycle::Monthly);
        assert!(pro.features.advanced_analytics);
        assert!(pro.features.custom_templates);
        assert!(!pro.features.white_labeling);

        let premium = PlanDefinition::premium(BillingCycle::Yearly);
        assert!(premium.features.white_labeling);
        assert!(premium.features.priority_support);
    }

    #[test]
    fn test_unlimited_limits_are_none() {
        let premium = PlanDefinition::premium(BillingCycle::Monthly);
        assert_eq!(premium.limit_for(ResourceKind::Templates), None);
        assert_eq!(premium.limit_for(ResourceKind::Domains), None);

        let basic = PlanDefinition::basic(BillingCycle::Monthly);
        assert_eq!(basic.limit_for(ResourceKind::Templates), Some(10));
        assert_eq!(basic.limit_for(ResourceKind::Domains), Some(1));
    }

    #[test]
    fn test_resolve_price() {
        let catalog = catalog();
        assert_eq!(catalog.resolve_price("price_pro_m"), Some(PlanId::ProMonthly));
        assert_eq!(catalog.resolve_price("price_unknown"), None);
    }

    #[test]
    fn test_price_ref_reverse_lookup() {
        let catalog = catalog();
        assert_eq!(catalog.price_ref_for(PlanId::BasicYearly), Some("price_basic_y"));
        assert_eq!(catalog.price_ref_for(PlanId::PremiumMonthly), None);
    }

    #[test]
    fn test_downgrade_classification() {
        assert!(PlanCatalog::is_downgrade(PlanId::ProMonthly, PlanId::BasicMonthly));
        assert!(PlanCatalog::is_downgrade(PlanId::PremiumYearly, PlanId::FreeTrial));
        assert!(!PlanCatalog::is_downgrade(PlanId::BasicMonthly, PlanId::BasicYearly));
        assert!(!PlanCatalog::is_downgrade(PlanId::FreeTrial, PlanId::BasicMonthly));
    }

    #[test]
    fn test_unknown_plan_falls_back_to_trial() {
        let catalog = catalog();
        assert!(catalog.resolve_plan_str("enterprise_2019").is_none());
        let fallback = catalog.get_or_trial(PlanId::FreeTrial);
        assert_eq!(fallback.id, PlanId::FreeTrial);
    }
}
