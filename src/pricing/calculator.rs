// Fare Calculator
//
// Evaluates an application plan against a pricing context. Every product and
// quotient is rounded half-even to scale 6; amounts are rounded to the
// currency's scale only when the breakdown is produced.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::pricing::combiner::ApplicationPlan;
use crate::pricing::context::PricingContext;
use crate::pricing::error::{PricingError, PricingResult};
use crate::pricing::money;
use crate::pricing::rule::{PriceRule, TierBand};
use crate::pricing::types::{DiscountType, PricingModel, RuleCategory, RuleType};

/// Base fare split into its terms, before surge
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FareComponents {
    pub base: Decimal,
    pub distance: Decimal,
    pub time: Decimal,
    /// Uplift added by all surges together
    pub surge: Decimal,
}

/// One rule's contribution to the fare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRule {
    pub rule_id: String,
    pub category: RuleCategory,
    /// Base fare for the base rule, uplift for a surge, reduction for a discount
    pub amount: Decimal,
}

/// Auditable result of one fare evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FareBreakdown {
    pub currency: String,
    pub components: FareComponents,
    pub original_amount: Decimal,
    pub surged_amount: Decimal,
    pub total_discount: Decimal,
    pub platform_fee: Decimal,
    pub discounted_amount: Decimal,
    pub payment_amount: Decimal,
    pub applied_rules: Vec<AppliedRule>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl FareBreakdown {
    /// Id of the base rule that priced this fare
    pub fn base_rule_id(&self) -> Option<&str> {
        self.applied_rules
            .iter()
            .find(|applied| applied.category == RuleCategory::BasePricing)
            .map(|applied| applied.rule_id.as_str())
    }

    /// Ids of every applied rule, in application order
    pub fn rule_ids(&self) -> Vec<String> {
        self.applied_rules.iter().map(|a| a.rule_id.clone()).collect()
    }
}

/// Piecewise sum over tier bands
///
/// Each band entered by `scalar` contributes `rate × overlap` plus its flat
/// `amount`.
pub fn tiered_sum(bands: &[TierBand], scalar: Decimal) -> PricingResult<Decimal> {
    let mut total = Decimal::ZERO;
    for band in bands {
        if scalar < band.lower {
            break;
        }
        let top = band.upper.map_or(scalar, |upper| scalar.min(upper));
        let overlap = (top - band.lower).max(Decimal::ZERO);
        if let Some(rate) = band.rate {
            total = money::add(total, money::mul(rate, overlap)?)?;
        }
        if let Some(amount) = band.amount {
            total = money::add(total, amount)?;
        }
    }
    Ok(total)
}

/// Base fare terms for the selected base rule
fn base_components(rule: &PriceRule, ctx: &PricingContext) -> PricingResult<FareComponents> {
    let rates = &rule.rates;
    let mut components = FareComponents {
        base: money::internal(rates.base_rate),
        ..Default::default()
    };

    if rule.pricing_model == PricingModel::FixedRate {
        return Ok(components);
    }

    if rule.rule_type == RuleType::Tiered {
        if rule.pricing_model == PricingModel::TimeBased {
            components.time = tiered_sum(&rule.tiers, ctx.duration_min)?;
        } else {
            components.distance = tiered_sum(&rule.tiers, ctx.distance_km)?;
        }
        return Ok(components);
    }

    components.distance = money::mul(rates.per_km_rate, ctx.distance_km)?;
    components.time = money::mul(rates.per_minute_rate, ctx.duration_min)?;
    Ok(components)
}

/// Combined multiplier of a surge rule
fn surge_factor(rule: &PriceRule) -> PricingResult<Decimal> {
    let factors = &rule.factors;
    let mut factor = rule.rates.surge_multiplier.unwrap_or(Decimal::ONE);
    for term in [factors.demand, factors.supply, factors.weather, factors.event] {
        factor = money::mul(factor, term)?;
    }
    if factor <= Decimal::ZERO {
        tracing::error!("Surge rule {} reached the calculator with factor {}", rule.rule_id, factor);
        return Err(PricingError::Internal(format!(
            "non-positive surge factor {} on rule {}",
            factor, rule.rule_id
        )));
    }
    Ok(factor)
}

enum DiscountOutcome {
    Amount(Decimal),
    Skipped(String),
}

/// Raw discount amount of one rule, before the max-discount cap
fn discount_amount(
    rule: &PriceRule,
    original: Decimal,
    surged: Decimal,
    running: Decimal,
) -> PricingResult<DiscountOutcome> {
    if let Some(kind @ (DiscountType::BuyXGetY | DiscountType::FreeDelivery)) = rule.discount_type {
        return Ok(DiscountOutcome::Skipped(format!(
            "{} UnsupportedDiscountType:{}",
            rule.rule_id, kind
        )));
    }

    let rates = &rule.rates;
    let amount = match rule.rule_type {
        RuleType::Percentage => {
            let basis = if rule.apply_on_original { original } else { surged };
            money::percent_of(basis, rates.discount_percent.unwrap_or(Decimal::ZERO))?
        }
        RuleType::FixedAmount => rates.discount_amount.unwrap_or(Decimal::ZERO).min(running),
        RuleType::Tiered => match rule.tiers.iter().find(|band| band.contains(surged)) {
            Some(band) => match (band.rate, band.amount) {
                (Some(percent), _) => money::percent_of(surged, percent)?,
                (None, Some(amount)) => amount,
                (None, None) => Decimal::ZERO,
            },
            None => {
                return Ok(DiscountOutcome::Skipped(format!("{} NoMatchingTier", rule.rule_id)))
            }
        },
        RuleType::Multiplier => match rates.surge_multiplier {
            Some(m) if m > Decimal::ZERO => {
                money::mul(surged, Decimal::ONE - m)?.max(Decimal::ZERO)
            }
            _ => {
                return Ok(DiscountOutcome::Skipped(format!(
                    "{} InvalidMultiplier",
                    rule.rule_id
                )))
            }
        },
        RuleType::Custom => {
            return Ok(DiscountOutcome::Skipped(format!(
                "{} UnsupportedRuleType:custom",
                rule.rule_id
            )))
        }
    };

    Ok(DiscountOutcome::Amount(amount))
}

/// Display amount of one part of a running total
///
/// Parts are differences of the rounded cumulative total, so the shown parts
/// always add up to the shown total.
fn shown_part(cumulative: Decimal, shown_so_far: &mut Decimal, currency: &str) -> Decimal {
    let part = money::display(cumulative, currency) - *shown_so_far;
    *shown_so_far += part;
    part
}

/// Evaluate `plan` for `ctx`
///
/// `default_platform_fee` applies when the context carries none.
pub fn calculate(
    plan: &ApplicationPlan,
    ctx: &PricingContext,
    default_platform_fee: Decimal,
) -> PricingResult<FareBreakdown> {
    let currency = ctx.currency.as_str();
    let mut warnings = plan.warnings.clone();
    let mut applied = Vec::new();

    // 1-3: base fare, clamped to the base rule's bounds
    let mut components = FareComponents::default();
    let mut fare = Decimal::ZERO;
    if let Some(rule) = &plan.base {
        components = base_components(rule, ctx)?;
        let unclamped = money::add(money::add(components.base, components.distance)?, components.time)?;
        fare = money::clamp(unclamped, rule.rates.minimum_fare, rule.rates.maximum_fare);
        applied.push(AppliedRule {
            rule_id: rule.rule_id.clone(),
            category: rule.category,
            amount: money::display(fare, currency),
        });
    }
    let original = fare;

    // 4-5: surges compose multiplicatively; a cap never undercuts the pre-surge fare
    let mut surge_shown = Decimal::ZERO;
    for rule in &plan.surges {
        let before = fare;
        fare = money::mul(fare, surge_factor(rule)?)?;
        if let Some(cap) = rule.rates.maximum_fare {
            fare = fare.min(cap.max(before));
        }
        applied.push(AppliedRule {
            rule_id: rule.rule_id.clone(),
            category: rule.category,
            amount: shown_part(fare - original, &mut surge_shown, currency),
        });
    }
    let surged = fare;
    components.surge = surged - original;

    // 6-7: discounts, subtracted sequentially
    let mut running = surged;
    let mut discount_shown = Decimal::ZERO;
    for planned in &plan.discounts {
        let rule = &planned.rule;

        if ctx.original_amount.is_none() {
            if let Some(min_order) = rule.rates.min_order_amount {
                if original < min_order {
                    warnings.push(format!("{} BelowMinOrderAmount", rule.rule_id));
                    continue;
                }
            }
        }

        let mut amount = match discount_amount(rule, original, surged, running)? {
            DiscountOutcome::Amount(amount) => amount,
            DiscountOutcome::Skipped(warning) => {
                tracing::debug!("Discount skipped: {}", warning);
                warnings.push(warning);
                continue;
            }
        };
        if let Some(cap) = rule.rates.max_discount {
            amount = amount.min(cap);
        }
        amount = amount.max(Decimal::ZERO).min(running);
        running -= amount;

        applied.push(AppliedRule {
            rule_id: rule.rule_id.clone(),
            category: rule.category,
            amount: shown_part(surged - running, &mut discount_shown, currency),
        });
    }
    let discounted = running;

    // 8
    let platform_fee = ctx.platform_fee.unwrap_or(default_platform_fee);
    let payment = money::add(discounted, platform_fee)?.max(Decimal::ZERO);

    Ok(FareBreakdown {
        currency: ctx.currency.clone(),
        components: FareComponents {
            base: money::display(components.base, currency),
            distance: money::display(components.distance, currency),
            time: money::display(components.time, currency),
            surge: money::display(components.surge, currency),
        },
        original_amount: money::display(original, currency),
        surged_amount: money::display(surged, currency),
        total_discount: money::display(surged - discounted, currency),
        platform_fee: money::display(platform_fee, currency),
        discounted_amount: money::display(discounted, currency),
        payment_amount: money::display(payment, currency),
        applied_rules: applied,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::combiner::PlannedDiscount;
    use crate::pricing::types::RuleStatus;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn ctx() -> PricingContext {
        PricingContext::new("rider-1", dec!(10), dec!(20), 1_773_480_600_000)
    }

    fn s1_base() -> PriceRule {
        let mut rule = PriceRule::new("base", "Base", RuleCategory::BasePricing, RuleType::FixedAmount);
        rule.status = RuleStatus::Active;
        rule.rates.base_rate = dec!(3.00);
        rule.rates.per_km_rate = dec!(1.50);
        rule.rates.per_minute_rate = dec!(0.25);
        rule.rates.minimum_fare = Some(dec!(5.00));
        rule.rates.maximum_fare = Some(dec!(200));
        rule
    }

    fn surge(id: &str, multiplier: Decimal) -> PriceRule {
        let mut rule = PriceRule::new(id, id, RuleCategory::SurgePricing, RuleType::Multiplier);
        rule.status = RuleStatus::Active;
        rule.rates.surge_multiplier = Some(multiplier);
        rule
    }

    fn percent(id: &str, pct: Decimal, cap: Option<Decimal>) -> PriceRule {
        let mut rule = PriceRule::new(id, id, RuleCategory::Discount, RuleType::Percentage);
        rule.status = RuleStatus::Active;
        rule.rates.discount_percent = Some(pct);
        rule.rates.max_discount = cap;
        rule
    }

    fn fixed(id: &str, amount: Decimal) -> PriceRule {
        let mut rule = PriceRule::new(id, id, RuleCategory::Promotion, RuleType::FixedAmount);
        rule.status = RuleStatus::Active;
        rule.rates.discount_amount = Some(amount);
        rule
    }

    fn plan(base: Option<PriceRule>, surges: Vec<PriceRule>, discounts: Vec<PriceRule>) -> ApplicationPlan {
        ApplicationPlan {
            base: base.map(Arc::new),
            surges: surges.into_iter().map(Arc::new).collect(),
            discounts: discounts
                .into_iter()
                .map(|rule| PlannedDiscount { rule: Arc::new(rule), code: None })
                .collect(),
            dropped: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_base_surge_and_percentage_discount() {
        let plan = plan(
            Some(s1_base()),
            vec![surge("surge", dec!(1.5))],
            vec![percent("pct20", dec!(20), Some(dec!(10)))],
        );
        let breakdown = calculate(&plan, &ctx(), dec!(2.00)).unwrap();

        assert_eq!(breakdown.original_amount, dec!(23.00));
        assert_eq!(breakdown.surged_amount, dec!(34.50));
        assert_eq!(breakdown.total_discount, dec!(6.90));
        assert_eq!(breakdown.discounted_amount, dec!(27.60));
        assert_eq!(breakdown.platform_fee, dec!(2.00));
        assert_eq!(breakdown.payment_amount, dec!(29.60));
        assert_eq!(breakdown.payment_amount.to_string(), "29.60");

        assert_eq!(breakdown.components.base, dec!(3.00));
        assert_eq!(breakdown.components.distance, dec!(15.00));
        assert_eq!(breakdown.components.time, dec!(5.00));
        assert_eq!(breakdown.components.surge, dec!(11.50));

        let amounts: Vec<_> = breakdown.applied_rules.iter().map(|a| (a.rule_id.as_str(), a.amount)).collect();
        assert_eq!(amounts, vec![("base", dec!(23.00)), ("surge", dec!(11.50)), ("pct20", dec!(6.90))]);
        assert_eq!(breakdown.base_rule_id(), Some("base"));
    }

    #[test]
    fn test_fixed_discount_after_surge() {
        let plan = plan(Some(s1_base()), vec![surge("surge", dec!(1.5))], vec![fixed("save5", dec!(5))]);
        let breakdown = calculate(&plan, &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.discounted_amount, dec!(29.50));
        assert_eq!(breakdown.payment_amount, dec!(29.50));
    }

    #[test]
    fn test_base_clamped_to_minimum() {
        let mut short = ctx();
        short.distance_km = dec!(0.5);
        short.duration_min = dec!(1);
        let breakdown = calculate(&plan(Some(s1_base()), vec![], vec![]), &short, Decimal::ZERO).unwrap();
        assert_eq!(breakdown.original_amount, dec!(5.00));
    }

    #[test]
    fn test_no_base_yields_zero_fare() {
        let mut empty = plan(None, vec![], vec![percent("p", dec!(10), None)]);
        empty.warnings.push("NoBasePricing".to_string());
        let breakdown = calculate(&empty, &ctx(), dec!(1)).unwrap();
        assert_eq!(breakdown.original_amount, Decimal::ZERO);
        assert_eq!(breakdown.payment_amount, dec!(1.00));
        assert!(breakdown.warnings.contains(&"NoBasePricing".to_string()));
    }

    #[test]
    fn test_surge_cap_never_undercuts_pre_surge_fare() {
        let mut capped = surge("capped", dec!(2));
        capped.rates.maximum_fare = Some(dec!(30));
        let breakdown = calculate(&plan(Some(s1_base()), vec![capped.clone()], vec![]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.surged_amount, dec!(30.00));

        capped.rates.maximum_fare = Some(dec!(10));
        let breakdown = calculate(&plan(Some(s1_base()), vec![capped], vec![]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.surged_amount, dec!(23.00));
    }

    #[test]
    fn test_dynamic_factors_multiply() {
        let mut rule = surge("dyn", dec!(1.2));
        rule.factors.demand = dec!(1.5);
        rule.factors.weather = dec!(1.1);
        let breakdown = calculate(&plan(Some(s1_base()), vec![rule], vec![]), &ctx(), Decimal::ZERO).unwrap();
        // 23 × 1.2 × 1.5 × 1.1 = 45.54
        assert_eq!(breakdown.surged_amount, dec!(45.54));
    }

    #[test]
    fn test_non_positive_surge_is_internal() {
        let rule = surge("bad", dec!(-1));
        let result = calculate(&plan(Some(s1_base()), vec![rule], vec![]), &ctx(), Decimal::ZERO);
        assert!(matches!(result, Err(PricingError::Internal(_))));
    }

    #[test]
    fn test_percentage_cap() {
        let breakdown = calculate(
            &plan(Some(s1_base()), vec![surge("s", dec!(1.5))], vec![percent("p", dec!(50), Some(dec!(10)))]),
            &ctx(),
            Decimal::ZERO,
        )
        .unwrap();
        assert_eq!(breakdown.total_discount, dec!(10.00));
        assert_eq!(breakdown.discounted_amount, dec!(24.50));
    }

    #[test]
    fn test_discount_parts_add_up_to_total() {
        // 0.0046 and 0.0045991 each round to 0.00 alone but 0.01 together
        let plan = plan(
            Some(s1_base()),
            vec![],
            vec![percent("a", dec!(0.02), None), percent("b", dec!(0.02), None)],
        );
        let breakdown = calculate(&plan, &ctx(), Decimal::ZERO).unwrap();

        assert_eq!(breakdown.total_discount, dec!(0.01));
        let parts: Vec<_> = breakdown.applied_rules[1..].iter().map(|a| a.amount).collect();
        assert_eq!(parts, vec![dec!(0.00), dec!(0.01)]);
    }

    #[test]
    fn test_percentage_on_original_when_flagged() {
        let mut rule = percent("p", dec!(20), None);
        rule.apply_on_original = true;
        let breakdown = calculate(&plan(Some(s1_base()), vec![surge("s", dec!(1.5))], vec![rule]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.total_discount, dec!(4.60));
    }

    #[test]
    fn test_discounts_never_go_negative() {
        let breakdown = calculate(
            &plan(Some(s1_base()), vec![], vec![fixed("f1", dec!(20)), fixed("f2", dec!(20))]),
            &ctx(),
            Decimal::ZERO,
        )
        .unwrap();
        assert_eq!(breakdown.discounted_amount, Decimal::ZERO);
        assert_eq!(breakdown.applied_rules[2].amount, dec!(3.00));
        assert_eq!(breakdown.total_discount, dec!(23.00));
    }

    #[test]
    fn test_tiered_base_by_distance() {
        let mut rule = s1_base();
        rule.rule_type = RuleType::Tiered;
        rule.tiers = vec![
            TierBand { lower: dec!(0), upper: Some(dec!(5)), rate: Some(dec!(2)), amount: None },
            TierBand { lower: dec!(5), upper: None, rate: Some(dec!(1)), amount: Some(dec!(0.50)) },
        ];
        let breakdown = calculate(&plan(Some(rule), vec![], vec![]), &ctx(), Decimal::ZERO).unwrap();
        // 3 + 5×2 + (5×1 + 0.50)
        assert_eq!(breakdown.original_amount, dec!(18.50));
        assert_eq!(breakdown.components.time, Decimal::ZERO);
    }

    #[test]
    fn test_tiered_base_by_duration() {
        let mut rule = s1_base();
        rule.rule_type = RuleType::Tiered;
        rule.pricing_model = PricingModel::TimeBased;
        rule.tiers = vec![TierBand { lower: dec!(0), upper: None, rate: Some(dec!(0.40)), amount: None }];
        let breakdown = calculate(&plan(Some(rule), vec![], vec![]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.original_amount, dec!(11.00));
    }

    #[test]
    fn test_fixed_rate_ignores_distance_and_time() {
        let mut rule = s1_base();
        rule.pricing_model = PricingModel::FixedRate;
        rule.rates.base_rate = dec!(12);
        let breakdown = calculate(&plan(Some(rule), vec![], vec![]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.original_amount, dec!(12.00));
    }

    #[test]
    fn test_tiered_discount_looks_up_surged_amount() {
        let mut rule = PriceRule::new("tier", "Tier", RuleCategory::Discount, RuleType::Tiered);
        rule.tiers = vec![
            TierBand { lower: dec!(0), upper: Some(dec!(30)), rate: None, amount: Some(dec!(1)) },
            TierBand { lower: dec!(30), upper: None, rate: Some(dec!(10)), amount: None },
        ];
        let breakdown = calculate(&plan(Some(s1_base()), vec![surge("s", dec!(1.5))], vec![rule]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.total_discount, dec!(3.45));
    }

    #[test]
    fn test_multiplier_discount() {
        let mut rule = PriceRule::new("mult", "Mult", RuleCategory::SpecialOffer, RuleType::Multiplier);
        rule.rates.surge_multiplier = Some(dec!(0.9));
        let breakdown = calculate(&plan(Some(s1_base()), vec![], vec![rule]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.total_discount, dec!(2.30));
    }

    #[test]
    fn test_unsupported_kinds_are_skipped_with_warning() {
        let custom = PriceRule::new("custom", "C", RuleCategory::Discount, RuleType::Custom);
        let mut bogo = percent("bogo", dec!(50), None);
        bogo.discount_type = Some(DiscountType::BuyXGetY);
        let breakdown = calculate(&plan(Some(s1_base()), vec![], vec![custom, bogo]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.total_discount, Decimal::ZERO);
        assert!(breakdown.warnings.contains(&"custom UnsupportedRuleType:custom".to_string()));
        assert!(breakdown.warnings.contains(&"bogo UnsupportedDiscountType:buy_x_get_y".to_string()));
    }

    #[test]
    fn test_deferred_min_order_amount() {
        let mut rule = fixed("f", dec!(5));
        rule.rates.min_order_amount = Some(dec!(30));
        let breakdown = calculate(&plan(Some(s1_base()), vec![], vec![rule]), &ctx(), Decimal::ZERO).unwrap();
        assert_eq!(breakdown.total_discount, Decimal::ZERO);
        assert!(breakdown.warnings.contains(&"f BelowMinOrderAmount".to_string()));
    }

    #[test]
    fn test_context_platform_fee_overrides_default() {
        let mut with_fee = ctx();
        with_fee.platform_fee = Some(dec!(0.75));
        let breakdown = calculate(&plan(Some(s1_base()), vec![], vec![]), &with_fee, dec!(2)).unwrap();
        assert_eq!(breakdown.payment_amount, dec!(23.75));
    }

    #[test]
    fn test_zero_decimal_currency() {
        let mut yen = ctx();
        yen.currency = "JPY".to_string();
        let breakdown = calculate(&plan(Some(s1_base()), vec![surge("s", dec!(1.5))], vec![]), &yen, Decimal::ZERO).unwrap();
        assert_eq!(breakdown.surged_amount.to_string(), "34");
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::pricing::combiner::PlannedDiscount;
    use crate::pricing::types::RuleStatus;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn cents(max: i64) -> impl Strategy<Value = Decimal> {
        (0..max).prop_map(|c| Decimal::new(c, 2))
    }

    fn arb_discount() -> impl Strategy<Value = PriceRule> {
        (any::<bool>(), cents(10_000), 0..=100i64, proptest::option::of(cents(2_000)))
            .prop_map(|(is_percent, amount, pct, cap)| {
                let rule_type = if is_percent { RuleType::Percentage } else { RuleType::FixedAmount };
                let mut rule = PriceRule::new("d", "d", RuleCategory::Discount, rule_type);
                rule.status = RuleStatus::Active;
                rule.rates.discount_amount = Some(amount);
                rule.rates.discount_percent = Some(Decimal::from(pct));
                rule.rates.max_discount = cap;
                rule
            })
    }

    fn arb_plan() -> impl Strategy<Value = ApplicationPlan> {
        (
            cents(1_000),
            cents(500),
            cents(100),
            proptest::collection::vec((100..300i64).prop_map(|m| Decimal::new(m, 2)), 0..3),
            proptest::collection::vec(arb_discount(), 0..4),
        )
            .prop_map(|(base_rate, per_km, per_min, multipliers, discounts)| {
                let mut base = PriceRule::new("base", "base", RuleCategory::BasePricing, RuleType::FixedAmount);
                base.rates.base_rate = base_rate;
                base.rates.per_km_rate = per_km;
                base.rates.per_minute_rate = per_min;
                ApplicationPlan {
                    base: Some(Arc::new(base)),
                    surges: multipliers
                        .into_iter()
                        .enumerate()
                        .map(|(i, m)| {
                            let mut rule = PriceRule::new(format!("s{}", i), "s", RuleCategory::SurgePricing, RuleType::Multiplier);
                            rule.rates.surge_multiplier = Some(m);
                            Arc::new(rule)
                        })
                        .collect(),
                    discounts: discounts
                        .into_iter()
                        .map(|rule| PlannedDiscount { rule: Arc::new(rule), code: None })
                        .collect(),
                    dropped: Vec::new(),
                    warnings: Vec::new(),
                }
            })
    }

    proptest! {
        #[test]
        fn fare_ordering_invariants(plan in arb_plan(), km in 0..200i64, min in 0..240i64, fee in -500..500i64) {
            let mut ctx = PricingContext::new("rider", Decimal::from(km), Decimal::from(min), 0);
            ctx.platform_fee = None;
            let breakdown = calculate(&plan, &ctx, Decimal::new(fee, 2)).unwrap();

            prop_assert!(breakdown.discounted_amount <= breakdown.surged_amount);
            prop_assert!(breakdown.surged_amount >= breakdown.original_amount);
            prop_assert!(breakdown.payment_amount >= Decimal::ZERO);
            prop_assert!(breakdown.discounted_amount >= Decimal::ZERO);
        }

        #[test]
        fn percentage_discounts_respect_their_cap(plan in arb_plan(), km in 0..200i64) {
            let ctx = PricingContext::new("rider", Decimal::from(km), Decimal::from(10), 0);
            let breakdown = calculate(&plan, &ctx, Decimal::ZERO).unwrap();

            for (applied, planned) in breakdown.applied_rules.iter().skip(1 + plan.surges.len()).zip(&plan.discounts) {
                if let Some(cap) = planned.rule.rates.max_discount {
                    prop_assert!(applied.amount <= cap);
                }
            }
        }

        #[test]
        fn shown_parts_add_up_to_shown_totals(plan in arb_plan(), km in 0..200i64, min in 0..240i64) {
            let ctx = PricingContext::new("rider", Decimal::from(km), Decimal::from(min), 0);
            let breakdown = calculate(&plan, &ctx, Decimal::ZERO).unwrap();

            let surges = plan.surges.len();
            let surge_sum: Decimal = breakdown.applied_rules[1..1 + surges].iter().map(|a| a.amount).sum();
            let discount_sum: Decimal = breakdown.applied_rules[1 + surges..].iter().map(|a| a.amount).sum();
            prop_assert_eq!(surge_sum, breakdown.components.surge);
            prop_assert_eq!(discount_sum, breakdown.total_discount);
        }

        #[test]
        fn calculation_is_deterministic(plan in arb_plan(), km in 0..200i64, min in 0..240i64) {
            let ctx = PricingContext::new("rider", Decimal::from(km), Decimal::from(min), 0);
            let first = calculate(&plan, &ctx, Decimal::ONE).unwrap();
            let second = calculate(&plan, &ctx, Decimal::ONE).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
