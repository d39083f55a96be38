use std::collections::HashMap;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipTier {
    #[default]
    Free,
    Basic,
    Pro,
    Premium,
}

impl MembershipTier {
    pub fn as_str(self) -> &'static str {
        match self {
            MembershipTier::Free => "free",
            MembershipTier::Basic => "basic",
            MembershipTier::Pro => "pro",
            MembershipTier::Premium => "premium",
        }
    }
}

pub fn resolve_tier(tier: Option<&str>) -> MembershipTier {
    match tier
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "basic" => MembershipTier::Basic,
        "pro" => MembershipTier::Pro,
        "premium" => MembershipTier::Premium,
        _ => MembershipTier::Free,
    }
}

pub fn is_subscription_active(status: Option<&str>) -> bool {
    matches!(
        status
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "active" | "trialing"
    )
}

/// One-time purchase granting a fixed number of credits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreditPack {
    pub price_id: String,
    pub credits: i64,
}

/// Recurring price; every paid invoice grants `monthly_credits`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionPlan {
    pub price_id: String,
    pub monthly_credits: i64,
    pub tier: MembershipTier,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Product {
    CreditPack(CreditPack),
    Subscription(SubscriptionPlan),
}

impl Product {
    pub fn checkout_mode(&self) -> &'static str {
        match self {
            Product::CreditPack(_) => "payment",
            Product::Subscription(_) => "subscription",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PriceMap {
    by_price_id: HashMap<String, Product>,
}

impl PriceMap {
    pub fn from_config(config: &Config) -> Self {
        let mut by_price_id = HashMap::new();
        for pack in &config.credit_packs {
            by_price_id.insert(pack.price_id.clone(), Product::CreditPack(pack.clone()));
        }
        for plan in &config.subscription_plans {
            by_price_id.insert(plan.price_id.clone(), Product::Subscription(plan.clone()));
        }
        Self { by_price_id }
    }

    pub fn product_for_price_id(&self, price_id: Option<&str>) -> Option<&Product> {
        let price_id = price_id?.trim();
        if price_id.is_empty() {
            return None;
        }
        self.by_price_id.get(price_id)
    }

    pub fn tier_for_price_id(&self, price_id: Option<&str>) -> Option<MembershipTier> {
        match self.product_for_price_id(price_id)? {
            Product::Subscription(plan) => Some(plan.tier),
            Product::CreditPack(_) => None,
        }
    }
}

/// Parses `price_id:credits` entries separated by commas.
pub fn parse_credit_packs(raw: &str) -> anyhow::Result<Vec<CreditPack>> {
    let mut packs = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let mut parts = entry.split(':').map(str::trim);
        let price_id = parts.next().unwrap_or_default();
        let credits = parts.next().unwrap_or_default();
        if price_id.is_empty() || parts.next().is_some() {
            return Err(anyhow!("expected price_id:credits, got {entry:?}"));
        }
        packs.push(CreditPack {
            price_id: price_id.to_string(),
            credits: parse_positive(credits, entry)?,
        });
    }
    Ok(packs)
}

/// Parses `price_id:monthly_credits:tier` entries separated by commas.
pub fn parse_subscription_plans(raw: &str) -> anyhow::Result<Vec<SubscriptionPlan>> {
    let mut plans = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        let [price_id, credits, tier] = parts.as_slice() else {
            return Err(anyhow!(
                "expected price_id:monthly_credits:tier, got {entry:?}"
            ));
        };
        let tier = resolve_tier(Some(*tier));
        if price_id.is_empty() || tier == MembershipTier::Free {
            return Err(anyhow!("invalid subscription plan entry {entry:?}"));
        }
        plans.push(SubscriptionPlan {
            price_id: price_id.to_string(),
            monthly_credits: parse_positive(credits, entry)?,
            tier,
        });
    }
    Ok(plans)
}

fn parse_positive(value: &str, entry: &str) -> anyhow::Result<i64> {
    value
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| anyhow!("credit amount must be a positive integer in {entry:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_packs_and_plans() {
        let packs = parse_credit_packs("price_a:100, price_b:550").unwrap();
        assert_eq!(packs.len(), 2);
        assert_eq!(packs[1].credits, 550);

        let plans = parse_subscription_plans("price_m:300:pro").unwrap();
        assert_eq!(plans[0].tier, MembershipTier::Pro);
        assert_eq!(plans[0].monthly_credits, 300);

        assert!(parse_credit_packs("").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_credit_packs("price_a").is_err());
        assert!(parse_credit_packs("price_a:-3").is_err());
        assert!(parse_subscription_plans("price_m:300").is_err());
        assert!(parse_subscription_plans("price_m:300:free").is_err());
    }

    #[test]
    fn price_map_resolves_products() {
        let config = Config::for_tests();
        let map = PriceMap::from_config(&config);
        assert!(matches!(
            map.product_for_price_id(Some(" price_pack_100 ")),
            Some(Product::CreditPack(CreditPack { credits: 100, .. }))
        ));
        assert_eq!(
            map.tier_for_price_id(Some("price_pro_monthly")),
            Some(MembershipTier::Pro)
        );
        assert_eq!(map.tier_for_price_id(Some("price_pack_100")), None);
        assert!(map.product_for_price_id(Some("")).is_none());
        assert!(map.product_for_price_id(None).is_none());
    }

    #[test]
    fn subscription_status_and_tier_resolution() {
        assert!(is_subscription_active(Some("Active")));
        assert!(is_subscription_active(Some("trialing")));
        assert!(!is_subscription_active(Some("past_due")));
        assert!(!is_subscription_active(None));
        assert_eq!(resolve_tier(Some("PREMIUM")), MembershipTier::Premium);
        assert_eq!(resolve_tier(Some("gold")), MembershipTier::Free);
    }
}
