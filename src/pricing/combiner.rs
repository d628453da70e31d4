// Rule Combiner
//
// Turns the eligible candidates into an ordered application plan: at most one
// base rule, the surges in priority order, then the admitted discounts.

use serde::Serialize;
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use crate::pricing::eligibility::Candidate;
use crate::pricing::rule::PriceRule;
use crate::pricing::types::RuleCategory;

/// Why an eligible rule did not make it into the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "by")]
pub enum DropReason {
    /// Another base rule won the selection
    LowerPriorityBase(String),
    /// Exclusion list conflict with an admitted rule
    ExcludedBy(String),
    /// Neither whitelist admits the pair and implicit stacking does not apply
    NotStackableWith(String),
    /// Auto-applied rule displaced by a code-matched rule
    SupersededByCode(String),
    /// Surge multiplier or dynamic factor not positive
    InvalidMultiplier,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::LowerPriorityBase(by) => write!(f, "LowerPriorityBase:{}", by),
            DropReason::ExcludedBy(by) => write!(f, "ExcludedBy:{}", by),
            DropReason::NotStackableWith(by) => write!(f, "NotStackableWith:{}", by),
            DropReason::SupersededByCode(by) => write!(f, "SupersededByCode:{}", by),
            DropReason::InvalidMultiplier => f.write_str("InvalidMultiplier"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedRule {
    pub rule_id: String,
    pub reason: DropReason,
}

/// A discount admitted into the plan
#[derive(Debug, Clone)]
pub struct PlannedDiscount {
    pub rule: Arc<PriceRule>,
    pub code: Option<String>,
}

/// Ordered rules selected for one quote
#[derive(Debug, Clone, Default)]
pub struct ApplicationPlan {
    pub base: Option<Arc<PriceRule>>,
    pub surges: Vec<Arc<PriceRule>>,
    pub discounts: Vec<PlannedDiscount>,
    pub dropped: Vec<DroppedRule>,
    pub warnings: Vec<String>,
}

impl ApplicationPlan {
    /// Rule ids in application order
    pub fn rule_ids(&self) -> Vec<String> {
        self.rules().map(|rule| rule.rule_id.clone()).collect()
    }

    /// Every planned rule in application order
    pub fn rules(&self) -> impl Iterator<Item = &Arc<PriceRule>> {
        self.base
            .iter()
            .chain(self.surges.iter())
            .chain(self.discounts.iter().map(|d| &d.rule))
    }

    fn drop_rule(&mut self, rule: &PriceRule, reason: DropReason) {
        tracing::debug!("Dropping rule {} from plan: {}", rule.rule_id, reason);
        self.warnings.push(format!("{} {}", rule.rule_id, reason));
        self.dropped.push(DroppedRule {
            rule_id: rule.rule_id.clone(),
            reason,
        });
    }
}

/// Narrowness of a scope set: non-empty beats empty, then fewer members wins
fn set_narrowness(len: usize) -> (bool, Reverse<usize>) {
    (len > 0, Reverse(len))
}

/// Narrowness of the vehicle filters: most specific filter, then fewest filters
fn vehicle_narrowness(rule: &PriceRule) -> (u8, Reverse<usize>) {
    let filters = &rule.scope.vehicle_filters;
    if filters.is_empty() {
        return (0, Reverse(0));
    }
    let specificity = filters.iter().map(|f| f.specificity()).max().unwrap_or(0);
    (1 + specificity, Reverse(filters.len()))
}

/// Total order for base rule selection; the smallest key wins
#[allow(clippy::type_complexity)]
fn base_key(
    rule: &PriceRule,
) -> (
    i32,
    Reverse<(u8, Reverse<usize>)>,
    Reverse<(bool, Reverse<usize>)>,
    Reverse<(bool, Reverse<usize>)>,
    Reverse<i64>,
    &str,
) {
    (
        rule.priority(),
        Reverse(vehicle_narrowness(rule)),
        Reverse(set_narrowness(rule.scope.service_areas.len())),
        Reverse(set_narrowness(rule.scope.user_segments.len())),
        Reverse(rule.updated_at),
        rule.rule_id.as_str(),
    )
}

fn priority_key(rule: &PriceRule) -> (i32, &str) {
    (rule.priority(), rule.rule_id.as_str())
}

fn mutually_excluded(a: &PriceRule, b: &PriceRule) -> bool {
    a.combination.exclusive_rules.contains(&b.rule_id)
        || b.combination.exclusive_rules.contains(&a.rule_id)
}

/// Whether `candidate` may stack on top of the already admitted `admitted`
///
/// An explicit whitelist on either side admits the pair. Without whitelists,
/// two auto-applied rules of the same category stack implicitly; a
/// code-matched rule only stacks by whitelist.
fn stackable(candidate: &PlannedDiscount, admitted: &PlannedDiscount) -> bool {
    let (r, a) = (&candidate.rule, &admitted.rule);
    if a.combination.stackable_rules.contains(&r.rule_id)
        || r.combination.stackable_rules.contains(&a.rule_id)
    {
        return true;
    }
    r.combination.stackable_rules.is_empty()
        && a.combination.stackable_rules.is_empty()
        && r.category == a.category
        && candidate.code.is_none()
        && admitted.code.is_none()
}

fn surge_is_valid(rule: &PriceRule) -> bool {
    rule.rates
        .surge_multiplier
        .map_or(true, |m| m > rust_decimal::Decimal::ZERO)
        && rule.factors.all_positive()
}

/// Build the application plan
///
/// Deterministic in its input set: candidates are re-sorted by total orders
/// before any decision is made.
pub fn combine(candidates: &[Candidate]) -> ApplicationPlan {
    let mut plan = ApplicationPlan::default();

    let mut bases: Vec<&Candidate> = Vec::new();
    let mut surges: Vec<&Candidate> = Vec::new();
    let mut discounts: Vec<&Candidate> = Vec::new();
    for candidate in candidates {
        match candidate.rule.category {
            RuleCategory::BasePricing => bases.push(candidate),
            RuleCategory::SurgePricing => surges.push(candidate),
            RuleCategory::Discount | RuleCategory::Promotion | RuleCategory::SpecialOffer => {
                discounts.push(candidate)
            }
        }
    }

    // Base
    bases.sort_by(|a, b| base_key(&a.rule).cmp(&base_key(&b.rule)));
    let mut bases = bases.into_iter();
    match bases.next() {
        Some(winner) => {
            let winner_id = winner.rule.rule_id.clone();
            plan.base = Some(Arc::clone(&winner.rule));
            for loser in bases {
                plan.drop_rule(&loser.rule, DropReason::LowerPriorityBase(winner_id.clone()));
            }
        }
        None => plan.warnings.push("NoBasePricing".to_string()),
    }

    // Surges
    surges.sort_by(|a, b| priority_key(&a.rule).cmp(&priority_key(&b.rule)));
    for candidate in surges {
        let rule = &candidate.rule;
        if !surge_is_valid(rule) {
            plan.drop_rule(rule, DropReason::InvalidMultiplier);
            continue;
        }
        let conflict = plan
            .surges
            .iter()
            .find(|admitted| mutually_excluded(admitted, rule))
            .map(|admitted| admitted.rule_id.clone());
        match conflict {
            Some(by) => plan.drop_rule(rule, DropReason::ExcludedBy(by)),
            None => plan.surges.push(Arc::clone(rule)),
        }
    }

    // Discounts: code-matched first, then auto-applied, each in priority order
    discounts.sort_by(|a, b| {
        (a.code.is_none(), priority_key(&a.rule)).cmp(&(b.code.is_none(), priority_key(&b.rule)))
    });
    for candidate in discounts {
        let planned = PlannedDiscount {
            rule: Arc::clone(&candidate.rule),
            code: candidate.code.clone(),
        };

        let mut refusal = None;
        for admitted in &plan.discounts {
            let superseded = admitted.code.is_some() && planned.code.is_none();
            let by = admitted.rule.rule_id.clone();
            if mutually_excluded(&admitted.rule, &planned.rule) {
                refusal = Some(if superseded {
                    DropReason::SupersededByCode(by)
                } else {
                    DropReason::ExcludedBy(by)
                });
                break;
            }
            if !stackable(&planned, admitted) {
                refusal = Some(if superseded {
                    DropReason::SupersededByCode(by)
                } else {
                    DropReason::NotStackableWith(by)
                });
                break;
            }
        }

        match refusal {
            Some(reason) => plan.drop_rule(&planned.rule, reason),
            None => plan.discounts.push(planned),
        }
    }

    plan
}
