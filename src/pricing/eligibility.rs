// Eligibility filter
//
// Pure predicate evaluation of rules against a pricing context. Rejections are
// reported with a reason for debugging and never raise an error.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::pricing::context::PricingContext;
use crate::pricing::rule::PriceRule;
use crate::pricing::types::RuleStatus;

/// Why a rule was left out of a quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail")]
pub enum RejectionReason {
    NotActive(RuleStatus),
    NotStarted,
    Ended,
    DayOfWeek,
    TimeOfDay,
    ExcludedDate,
    NotIncludedDate,
    Vehicle,
    ServiceArea,
    UserSegment,
    OrderType,
    Distance,
    Duration,
    BelowMinOrderAmount,
    TotalUsageExhausted,
    DailyUsageExhausted,
    UserUsageExhausted,
    /// Per-user cap could not be checked because the usage store failed
    UserUsageUnavailable,
    CodeRequired,
    NotAutoApplied,
    ExcludedByCaller,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NotActive(status) => write!(f, "NotActive:{}", status),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A rule that passed every predicate, with the promo code that matched it
#[derive(Debug, Clone)]
pub struct Candidate {
    pub rule: Arc<PriceRule>,
    pub code: Option<String>,
}

impl Candidate {
    pub fn via_code(&self) -> bool {
        self.code.is_some()
    }
}

/// Filter output
#[derive(Debug, Clone, Default)]
pub struct EligibilityOutcome {
    pub eligible: Vec<Candidate>,
    pub rejected: Vec<(String, RejectionReason)>,
}

/// Per-user usage as known to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserUsage {
    Known(i64),
    Unavailable,
}

fn within(value: Decimal, min: Option<Decimal>, max: Option<Decimal>) -> bool {
    min.map_or(true, |min| value >= min) && max.map_or(true, |max| value <= max)
}

/// Evaluate every predicate for one rule
///
/// `code` is the promo code that resolved to this rule, if any; `user_usage`
/// is only consulted when the rule carries a per-user cap.
pub fn check(
    rule: &PriceRule,
    ctx: &PricingContext,
    code: Option<&str>,
    user_usage: Option<UserUsage>,
) -> Result<(), RejectionReason> {
    if ctx.is_excluded(&rule.rule_id) {
        return Err(RejectionReason::ExcludedByCaller);
    }

    if rule.status != RuleStatus::Active {
        return Err(RejectionReason::NotActive(rule.status));
    }

    let scope = &rule.scope;
    if scope.started_at.map_or(false, |started| ctx.now_ms < started) {
        return Err(RejectionReason::NotStarted);
    }
    if scope.ended_at.map_or(false, |ended| ctx.now_ms > ended) {
        return Err(RejectionReason::Ended);
    }

    if let Some(days) = &scope.days_of_week {
        if !days.is_empty() && !days.contains(&ctx.local_day_of_week) {
            return Err(RejectionReason::DayOfWeek);
        }
    }

    if !scope.time_slots.is_empty() {
        let minute = ctx.minute_of_day();
        if !scope.time_slots.iter().any(|slot| slot.contains(minute)) {
            return Err(RejectionReason::TimeOfDay);
        }
    }

    let today = ctx.today();
    if scope.excluded_dates.contains(&today) {
        return Err(RejectionReason::ExcludedDate);
    }
    if !scope.included_dates.is_empty() && !scope.included_dates.contains(&today) {
        return Err(RejectionReason::NotIncludedDate);
    }

    if !scope.vehicle_filters.is_empty()
        && !scope.vehicle_filters.iter().any(|filter| {
            filter.matches(ctx.vehicle_category.as_deref(), ctx.vehicle_level.as_deref())
        })
    {
        return Err(RejectionReason::Vehicle);
    }

    if !scope.service_areas.is_empty() {
        let admitted = ctx
            .service_area_id
            .as_ref()
            .map_or(false, |area| scope.service_areas.contains(area));
        if !admitted {
            return Err(RejectionReason::ServiceArea);
        }
    }

    if !scope.user_segments.is_empty()
        && !ctx
            .user_segments
            .iter()
            .any(|segment| scope.user_segments.contains(segment))
    {
        return Err(RejectionReason::UserSegment);
    }

    if !scope.order_types.is_empty() && !scope.order_types.contains(&ctx.order_type) {
        return Err(RejectionReason::OrderType);
    }

    let limits = &rule.limits;
    if !within(ctx.distance_km, limits.min_distance_km, limits.max_distance_km) {
        return Err(RejectionReason::Distance);
    }
    if !within(ctx.duration_min, limits.min_duration_min, limits.max_duration_min) {
        return Err(RejectionReason::Duration);
    }

    // Without an amount in the context the calculator checks this instead
    if let (Some(amount), Some(min_order)) = (ctx.original_amount, rule.rates.min_order_amount) {
        if amount < min_order {
            return Err(RejectionReason::BelowMinOrderAmount);
        }
    }

    if limits.total_exhausted() {
        return Err(RejectionReason::TotalUsageExhausted);
    }
    if let Some(cap) = limits.max_usage_per_day {
        if limits.usage_on(today) >= cap {
            return Err(RejectionReason::DailyUsageExhausted);
        }
    }
    if let Some(cap) = limits.max_usage_per_user {
        match user_usage {
            Some(UserUsage::Known(count)) if count >= cap => {
                return Err(RejectionReason::UserUsageExhausted)
            }
            Some(UserUsage::Known(_)) | None => {}
            Some(UserUsage::Unavailable) => return Err(RejectionReason::UserUsageUnavailable),
        }
    }

    if rule.code.requires_code && code.is_none() {
        return Err(RejectionReason::CodeRequired);
    }
    if rule.category.is_discount_family()
        && !rule.code.requires_code
        && !rule.code.auto_apply
        && code.is_none()
    {
        return Err(RejectionReason::NotAutoApplied);
    }

    Ok(())
}

/// Split `rules` into eligible candidates and rejections, preserving input order
///
/// `codes` maps rule id to the promo code that resolved to it.
pub fn filter(
    rules: &[Arc<PriceRule>],
    ctx: &PricingContext,
    codes: &HashMap<String, String>,
    user_usage: &HashMap<String, UserUsage>,
) -> EligibilityOutcome {
    let mut outcome = EligibilityOutcome::default();

    for rule in rules {
        let code = codes.get(&rule.rule_id).map(String::as_str);
        let usage = user_usage.get(&rule.rule_id).copied();
        match check(rule, ctx, code, usage) {
            Ok(()) => outcome.eligible.push(Candidate {
                rule: Arc::clone(rule),
                code: code.map(str::to_string),
            }),
            Err(reason) => {
                tracing::debug!("Rule {} rejected: {}", rule.rule_id, reason);
                outcome.rejected.push((rule.rule_id.clone(), reason));
            }
        }
    }

    outcome
}
