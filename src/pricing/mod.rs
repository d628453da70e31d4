// Pricing Module
//
// Rule-driven fare computation for ride orders:
// - Rule catalog: versioned snapshot of active price rules, refreshed on TTL
// - Eligibility: pure predicate evaluation against a pricing context
// - Promo codes: resolution of user-supplied codes onto code-gated rules
// - Combination: base selection, surge ordering and discount stacking
// - Calculation: fixed-scale decimal evaluation of the application plan
// - Usage accounting: reserve / confirm / release of rule usage counters

pub mod audit;
pub mod calculator;
pub mod catalog;
pub mod combiner;
pub mod context;
pub mod eligibility;
pub mod error;
pub mod metrics;
pub mod money;
pub mod promo;
pub mod repository;
pub mod rule;
pub mod types;
pub mod usage;

pub use audit::{AuditEvent, AuditLogger, AuditRecord};
pub use calculator::{AppliedRule, FareBreakdown, FareComponents};
pub use catalog::{RuleCatalog, RuleSnapshot};
pub use combiner::{ApplicationPlan, DropReason, DroppedRule, PlannedDiscount};
pub use context::PricingContext;
pub use eligibility::{Candidate, EligibilityOutcome, RejectionReason, UserUsage};
pub use error::{PricingError, PricingResult};
pub use metrics::{MetricsSummary, PerformanceMetrics};
pub use promo::{CodeMatch, PromoResolution};
pub use repository::{PgRuleStore, RuleStore};
pub use rule::{PriceRule, RulePatch};
pub use types::{DiscountType, PricingModel, RuleCategory, RuleStatus, RuleType};
pub use usage::{PgUsageStore, UsageAccountant, UsageClaim, UsageStore};

// Pricing Engine - Orchestrator
//
// Runs the quote pipeline and fronts the admin operations on rules.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default lifetime of a quote before it can no longer be attached
pub const DEFAULT_QUOTE_TTL: Duration = Duration::from_secs(15 * 60);

/// Instant `ttl` after `now_ms`, clamped to the end of representable time
fn expiry(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// A computed fare offered to a rider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: String,
    pub context: PricingContext,
    /// Codes as supplied by the caller
    pub codes: Vec<String>,
    /// Codes that resolved to a rule
    pub matched: Vec<CodeMatch>,
    pub breakdown: FareBreakdown,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl Quote {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Ids of code-matched rules that made it into the fare
    pub fn promo_rule_ids(&self) -> Vec<String> {
        let applied = self.breakdown.rule_ids();
        self.matched
            .iter()
            .filter(|m| applied.contains(&m.rule_id))
            .map(|m| m.rule_id.clone())
            .collect()
    }

    /// Codes whose rules made it into the fare
    pub fn applied_codes(&self) -> Vec<String> {
        let applied = self.breakdown.rule_ids();
        self.matched
            .iter()
            .filter(|m| applied.contains(&m.rule_id))
            .map(|m| m.code.clone())
            .collect()
    }
}

/// Pricing Engine
///
/// Catalog → promo resolution → eligibility → combination → calculation.
pub struct PricingEngine {
    catalog: Arc<RuleCatalog>,
    usage: Arc<UsageAccountant>,
    rules: Arc<dyn RuleStore>,
    audit: Option<AuditLogger>,
    metrics: PerformanceMetrics,
    platform_fee: Decimal,
    quote_ttl: Duration,
}

impl PricingEngine {
    pub fn new(
        catalog: Arc<RuleCatalog>,
        usage: Arc<UsageAccountant>,
        rules: Arc<dyn RuleStore>,
        metrics: PerformanceMetrics,
        platform_fee: Decimal,
        quote_ttl: Duration,
    ) -> Self {
        Self {
            catalog,
            usage,
            rules,
            audit: None,
            metrics,
            platform_fee,
            quote_ttl,
        }
    }

    /// Attach an audit logger; quotes and reprices are recorded from then on
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.catalog
    }

    pub fn usage(&self) -> &Arc<UsageAccountant> {
        &self.usage
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn audit(&self) -> Option<&AuditLogger> {
        self.audit.as_ref()
    }

    /// Warm the catalog on startup
    pub async fn warm_catalog(&self) -> PricingResult<()> {
        tracing::info!("Warming rule catalog...");
        let snapshot = self.catalog.load().await?;
        tracing::info!("Rule catalog warmed with {} rules", snapshot.len());
        Ok(())
    }

    /// Price a prospective ride
    ///
    /// Ineligible rules never fail a quote; they are filtered out, and codes
    /// that matched nothing or whose rule was rejected show up as warnings.
    /// Only a malformed context or code, or an unavailable catalog, is an error.
    pub async fn quote(&self, ctx: PricingContext, codes: &[String]) -> PricingResult<Quote> {
        let _timer = self.metrics.start_quote();

        ctx.check()?;
        let snapshot = self.catalog.snapshot().await?;
        let resolution = promo::resolve(&snapshot, codes, ctx.now_ms)?;
        let code_by_rule = resolution.by_rule();

        let applicable = snapshot.list_applicable(ctx.now_ms);
        let user_usage = self.prefetch_user_usage(&applicable, &ctx.user_id).await;

        let outcome = eligibility::filter(&applicable, &ctx, &code_by_rule, &user_usage);
        let plan = combiner::combine(&outcome.eligible);
        let mut breakdown = calculator::calculate(&plan, &ctx, self.platform_fee)?;

        for code in &resolution.unmatched {
            breakdown.warnings.push(format!("UnmatchedCode:{}", code));
        }
        for (rule_id, reason) in &outcome.rejected {
            if let Some(code) = code_by_rule.get(rule_id) {
                breakdown
                    .warnings
                    .push(format!("CodeRejected:{}:{}", code, reason));
            }
        }
        for matched in &resolution.matched {
            if applicable.iter().any(|rule| rule.rule_id == matched.rule_id) {
                continue;
            }
            let status = snapshot
                .get(&matched.rule_id)
                .map_or(RuleStatus::Deleted, |rule| rule.effective_status(ctx.now_ms));
            breakdown.warnings.push(format!(
                "CodeRejected:{}:{}",
                matched.code,
                RejectionReason::NotActive(status)
            ));
        }

        let quote = Quote {
            quote_id: Uuid::new_v4().to_string(),
            codes: codes.to_vec(),
            matched: resolution.matched,
            breakdown,
            created_at_ms: ctx.now_ms,
            expires_at_ms: expiry(ctx.now_ms, self.quote_ttl),
            context: ctx,
        };

        tracing::debug!(
            "Quote {} for user {}: payment {} {} with {} rules",
            quote.quote_id,
            quote.context.user_id,
            quote.breakdown.payment_amount,
            quote.breakdown.currency,
            quote.breakdown.applied_rules.len()
        );

        if let Some(audit) = &self.audit {
            audit
                .log_quote(&quote.quote_id, &quote.breakdown, quote.created_at_ms)
                .await;
        }

        Ok(quote)
    }

    /// Per-user counts for every rule with a per-user cap
    ///
    /// A failed read marks the rule unavailable instead of failing the quote.
    async fn prefetch_user_usage(
        &self,
        rules: &[Arc<PriceRule>],
        user_id: &str,
    ) -> HashMap<String, UserUsage> {
        let mut usage = HashMap::new();
        for rule in rules.iter().filter(|r| r.limits.max_usage_per_user.is_some()) {
            let count = match self.usage.user_usage(&rule.rule_id, user_id).await {
                Ok(count) => UserUsage::Known(count),
                Err(err) => {
                    tracing::warn!(
                        "Per-user usage for rule {} unavailable: {}",
                        rule.rule_id,
                        err
                    );
                    UserUsage::Unavailable
                }
            };
            usage.insert(rule.rule_id.clone(), count);
        }
        usage
    }

    /// Re-evaluate a bound fare on new inputs (typically actual distance and duration)
    ///
    /// The rules of `bound` are applied again in their original roles without
    /// re-running eligibility or combination, so a rule paused since binding
    /// still prices this ride.
    pub async fn reprice(
        &self,
        bound: &FareBreakdown,
        ctx: &PricingContext,
    ) -> PricingResult<FareBreakdown> {
        ctx.check()?;

        let mut plan = ApplicationPlan::default();
        for applied in &bound.applied_rules {
            let rule = self.catalog.get_by_id(&applied.rule_id).await?;
            match rule.category {
                RuleCategory::BasePricing => plan.base = Some(rule),
                RuleCategory::SurgePricing => plan.surges.push(rule),
                RuleCategory::Discount | RuleCategory::Promotion | RuleCategory::SpecialOffer => {
                    plan.discounts.push(PlannedDiscount { rule, code: None })
                }
            }
        }

        calculator::calculate(&plan, ctx, self.platform_fee)
    }

    // ------------------------------------------------------------------
    // Rule administration
    // ------------------------------------------------------------------

    /// Store a new rule (normally a draft)
    pub async fn create_rule(&self, mut rule: PriceRule, now_ms: i64) -> PricingResult<PriceRule> {
        rule.validate()?;
        rule.version = 1;
        rule.created_at = now_ms;
        rule.updated_at = now_ms;
        self.rules.insert_rule(&rule).await?;
        self.catalog.invalidate(Some(&rule.rule_id)).await;
        tracing::info!("Created price rule {} ({})", rule.rule_id, rule.category);
        Ok(rule)
    }

    /// Apply a typed partial update on top of `expected_version`
    pub async fn patch_rule(
        &self,
        rule_id: &str,
        expected_version: i64,
        patch: RulePatch,
        now_ms: i64,
    ) -> PricingResult<PriceRule> {
        let current = self.load_rule(rule_id).await?;
        if current.version != expected_version {
            self.metrics.record_version_conflict();
            return Err(PricingError::VersionConflict(rule_id.to_string()));
        }
        let updated = patch.apply(&current, now_ms)?;
        self.save_rule(&updated, expected_version).await?;
        Ok(updated)
    }

    pub async fn approve_rule(
        &self,
        rule_id: &str,
        approver: &str,
        now_ms: i64,
    ) -> PricingResult<PriceRule> {
        self.edit_rule(rule_id, |rule| rule.approve(approver, now_ms))
            .await
    }

    pub async fn pause_rule(&self, rule_id: &str, now_ms: i64) -> PricingResult<PriceRule> {
        self.edit_rule(rule_id, |rule| rule.pause(now_ms)).await
    }

    pub async fn resume_rule(&self, rule_id: &str, now_ms: i64) -> PricingResult<PriceRule> {
        self.edit_rule(rule_id, |rule| rule.resume(now_ms)).await
    }

    pub async fn retire_rule(&self, rule_id: &str, now_ms: i64) -> PricingResult<PriceRule> {
        self.edit_rule(rule_id, |rule| {
            rule.retire(now_ms);
            Ok(())
        })
        .await
    }

    async fn load_rule(&self, rule_id: &str) -> PricingResult<PriceRule> {
        self.rules
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| PricingError::RuleNotFound(rule_id.to_string()))
    }

    async fn edit_rule<F>(&self, rule_id: &str, edit: F) -> PricingResult<PriceRule>
    where
        F: FnOnce(&mut PriceRule) -> PricingResult<()>,
    {
        let mut rule = self.load_rule(rule_id).await?;
        let expected_version = rule.version;
        edit(&mut rule)?;
        if rule.version != expected_version {
            self.save_rule(&rule, expected_version).await?;
        }
        Ok(rule)
    }

    async fn save_rule(&self, rule: &PriceRule, expected_version: i64) -> PricingResult<()> {
        match self.rules.update_rule(rule, expected_version).await {
            Ok(()) => {
                self.catalog.invalidate(Some(&rule.rule_id)).await;
                tracing::info!(
                    "Price rule {} now at version {} ({})",
                    rule.rule_id,
                    rule.version,
                    rule.status
                );
                Ok(())
            }
            Err(err) => {
                if matches!(err, PricingError::VersionConflict(_)) {
                    self.metrics.record_version_conflict();
                }
                Err(err)
            }
        }
    }
}



#[cfg(test)]
mod property_tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    fn amount() -> impl Strategy<Value = Decimal> {
        (0i64..100_000).prop_map(|cents| Decimal::new(cents, 2))
    }

    proptest! {
        /// Fare invariants hold for any distance, duration and discount mix
        #[test]
        fn prop_fare_bounds(
            distance in amount(),
            duration in amount(),
            multiplier in (100i64..300).prop_map(|m| Decimal::new(m, 2)),
            percent in (0i64..=100).prop_map(Decimal::from),
            fixed in amount(),
            cap in proptest::option::of(amount()),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let mut pct = percent_off("pct", percent, cap);
            pct.combination.stackable_rules = vec!["fixed".to_string()];
            let breakdown = runtime.block_on(async {
                let (_store, engine) = engine(vec![
                    city_base(),
                    surge(multiplier),
                    pct,
                    fixed_off("fixed", fixed),
                ])
                .await;
                let mut ctx = ctx();
                ctx.distance_km = distance;
                ctx.duration_min = duration;
                engine.quote(ctx, &[]).await.unwrap().breakdown
            });

            prop_assert!(breakdown.discounted_amount <= breakdown.surged_amount);
            prop_assert!(breakdown.surged_amount >= breakdown.original_amount);
            prop_assert!(breakdown.payment_amount >= Decimal::ZERO);
            if let Some(cap) = cap {
                for applied in breakdown.applied_rules.iter().filter(|a| a.rule_id == "pct") {
                    prop_assert!(applied.amount <= cap);
                }
            }
        }
    }
}
