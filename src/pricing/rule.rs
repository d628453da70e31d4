// Price rule model
//
// Typed projection of a `price_rules` row. Optional numerics are `Option`;
// defaults (dynamic factors of 1.0, zero counters) are resolved once when a row
// or JSON document is decoded, so evaluation code never falls back ad hoc.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::pricing::error::{PricingError, PricingResult};
use crate::pricing::types::{DiscountType, PricingModel, RuleCategory, RuleStatus, RuleType};

/// Wildcard accepted in vehicle filters
pub const WILDCARD: &str = "*";

/// (vehicle category, vehicle level) filter; empty or "*" matches anything
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VehicleFilter {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
}

impl VehicleFilter {
    pub fn new(category: Option<&str>, level: Option<&str>) -> Self {
        Self {
            category: category.map(str::to_string),
            level: level.map(str::to_string),
        }
    }

    fn is_wild(field: &Option<String>) -> bool {
        match field {
            None => true,
            Some(value) => value.is_empty() || value == WILDCARD,
        }
    }

    fn field_matches(field: &Option<String>, value: Option<&str>) -> bool {
        if Self::is_wild(field) {
            return true;
        }
        match (field, value) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }

    /// Whether the filter admits the given vehicle
    pub fn matches(&self, category: Option<&str>, level: Option<&str>) -> bool {
        Self::field_matches(&self.category, category) && Self::field_matches(&self.level, level)
    }

    /// Number of non-wildcard fields (0..=2)
    pub fn specificity(&self) -> u8 {
        (!Self::is_wild(&self.category)) as u8 + (!Self::is_wild(&self.level)) as u8
    }
}

/// Same-day time-of-day window, closed at both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
}

impl TimeSlot {
    pub fn new(start_hour: u8, start_minute: u8, end_hour: u8, end_minute: u8) -> Self {
        Self {
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        }
    }

    pub fn start_minutes(&self) -> u16 {
        self.start_hour as u16 * 60 + self.start_minute as u16
    }

    pub fn end_minutes(&self) -> u16 {
        self.end_hour as u16 * 60 + self.end_minute as u16
    }

    /// Windows never cross midnight; `end < start` is rejected at load
    pub fn crosses_midnight(&self) -> bool {
        self.end_minutes() < self.start_minutes()
    }

    /// Whether `minute_of_day` falls inside the window
    pub fn contains(&self, minute_of_day: u16) -> bool {
        !self.crosses_midnight()
            && self.start_minutes() <= minute_of_day
            && minute_of_day <= self.end_minutes()
    }
}

/// One band of a tiered rule: `[lower, upper)` with a per-unit rate or a flat amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBand {
    pub lower: Decimal,
    /// `None` means unbounded; only allowed on the last band
    #[serde(default)]
    pub upper: Option<Decimal>,
    #[serde(default)]
    pub rate: Option<Decimal>,
    #[serde(default)]
    pub amount: Option<Decimal>,
}

impl TierBand {
    pub fn contains(&self, value: Decimal) -> bool {
        value >= self.lower && self.upper.map_or(true, |upper| value < upper)
    }
}

fn one() -> Decimal {
    Decimal::ONE
}

/// Dynamic surge factors, each 1.0 unless set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicFactors {
    #[serde(default = "one")]
    pub demand: Decimal,
    #[serde(default = "one")]
    pub supply: Decimal,
    #[serde(default = "one")]
    pub weather: Decimal,
    #[serde(default = "one")]
    pub event: Decimal,
}

impl Default for DynamicFactors {
    fn default() -> Self {
        Self {
            demand: Decimal::ONE,
            supply: Decimal::ONE,
            weather: Decimal::ONE,
            event: Decimal::ONE,
        }
    }
}

impl DynamicFactors {
    pub fn all_positive(&self) -> bool {
        [self.demand, self.supply, self.weather, self.event]
            .iter()
            .all(|factor| *factor > Decimal::ZERO)
    }
}

/// Applicability facets; every empty set means "no restriction"
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleScope {
    #[serde(default)]
    pub vehicle_filters: Vec<VehicleFilter>,
    #[serde(default)]
    pub service_areas: Vec<String>,
    #[serde(default)]
    pub user_segments: Vec<String>,
    #[serde(default)]
    pub order_types: Vec<String>,
    /// ISO day numbers, 1 = Monday .. 7 = Sunday
    #[serde(default)]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(default)]
    pub time_slots: Vec<TimeSlot>,
    #[serde(default)]
    pub excluded_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub included_dates: Vec<NaiveDate>,
    /// Epoch milliseconds, inclusive
    #[serde(default)]
    pub started_at: Option<i64>,
    /// Epoch milliseconds, inclusive
    #[serde(default)]
    pub ended_at: Option<i64>,
    /// Advisory label only; all arithmetic is on UTC epoch
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Pricing numerics
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleRates {
    #[serde(default)]
    pub base_rate: Decimal,
    #[serde(default)]
    pub per_km_rate: Decimal,
    #[serde(default)]
    pub per_minute_rate: Decimal,
    #[serde(default)]
    pub minimum_fare: Option<Decimal>,
    #[serde(default)]
    pub maximum_fare: Option<Decimal>,
    #[serde(default)]
    pub discount_amount: Option<Decimal>,
    #[serde(default)]
    pub discount_percent: Option<Decimal>,
    #[serde(default)]
    pub surge_multiplier: Option<Decimal>,
    #[serde(default)]
    pub max_discount: Option<Decimal>,
    #[serde(default)]
    pub min_order_amount: Option<Decimal>,
    #[serde(default)]
    pub cancellation_fee: Option<Decimal>,
}

/// Usage caps, live counters and distance/duration bounds
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageLimits {
    #[serde(default)]
    pub max_usage_per_user: Option<i64>,
    #[serde(default)]
    pub max_usage_per_day: Option<i64>,
    #[serde(default)]
    pub max_usage_total: Option<i64>,
    #[serde(default)]
    pub usage_count: i64,
    #[serde(default)]
    pub usage_today: i64,
    /// Calendar day `usage_today` counts; a different day reads as zero
    #[serde(default)]
    pub usage_day: Option<NaiveDate>,
    #[serde(default)]
    pub min_distance_km: Option<Decimal>,
    #[serde(default)]
    pub max_distance_km: Option<Decimal>,
    #[serde(default)]
    pub min_duration_min: Option<Decimal>,
    #[serde(default)]
    pub max_duration_min: Option<Decimal>,
}

impl UsageLimits {
    pub fn usage_on(&self, day: NaiveDate) -> i64 {
        if self.usage_day == Some(day) {
            self.usage_today
        } else {
            0
        }
    }

    pub fn total_exhausted(&self) -> bool {
        self.max_usage_total
            .map_or(false, |cap| self.usage_count >= cap)
    }
}

/// Ordering and stacking constraints
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Combination {
    /// Smaller applies earlier
    #[serde(default)]
    pub priority: i32,
    /// Rule ids this rule may coexist with
    #[serde(default)]
    pub stackable_rules: Vec<String>,
    /// Rule ids this rule may never coexist with
    #[serde(default)]
    pub exclusive_rules: Vec<String>,
}

/// Promo code gating
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeGate {
    #[serde(default)]
    pub requires_code: bool,
    #[serde(default)]
    pub promo_code: Option<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default)]
    pub is_global: bool,
}

/// A persisted price rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRule {
    pub rule_id: String,
    pub version: i64,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_by: Option<String>,
    pub approved_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub audit_notes: Option<String>,

    pub category: RuleCategory,
    pub rule_type: RuleType,
    pub pricing_model: PricingModel,
    pub discount_type: Option<DiscountType>,

    pub scope: RuleScope,
    pub rates: RuleRates,
    #[serde(default)]
    pub tiers: Vec<TierBand>,
    #[serde(default)]
    pub factors: DynamicFactors,
    pub limits: UsageLimits,
    pub combination: Combination,
    pub code: CodeGate,
    /// Percentages apply to the pre-surge amount instead of the surged one
    #[serde(default)]
    pub apply_on_original: bool,
    pub status: RuleStatus,
}

impl PriceRule {
    /// A draft rule with empty scope and zero rates
    pub fn new(
        rule_id: impl Into<String>,
        name: impl Into<String>,
        category: RuleCategory,
        rule_type: RuleType,
    ) -> Self {
        let name = name.into();
        Self {
            rule_id: rule_id.into(),
            version: 1,
            display_name: name.clone(),
            name,
            description: None,
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
            created_by: None,
            approved_by: None,
            created_at: 0,
            updated_at: 0,
            audit_notes: None,
            category,
            rule_type,
            pricing_model: PricingModel::DistanceBased,
            discount_type: None,
            scope: RuleScope::default(),
            rates: RuleRates::default(),
            tiers: Vec::new(),
            factors: DynamicFactors::default(),
            limits: UsageLimits::default(),
            combination: Combination::default(),
            code: CodeGate::default(),
            apply_on_original: false,
            status: RuleStatus::Draft,
        }
    }

    pub fn priority(&self) -> i32 {
        self.combination.priority
    }

    /// Status as of `now_ms`: an active rule past its window or out of total
    /// usage reads as expired
    pub fn effective_status(&self, now_ms: i64) -> RuleStatus {
        if self.status != RuleStatus::Active {
            return self.status;
        }
        let window_closed = self.scope.ended_at.map_or(false, |ended| ended < now_ms);
        if window_closed || self.limits.total_exhausted() {
            RuleStatus::Expired
        } else {
            RuleStatus::Active
        }
    }

    /// Record a logical edit
    pub fn touch(&mut self, now_ms: i64) {
        self.version += 1;
        self.updated_at = now_ms;
    }

    /// draft → active
    pub fn approve(&mut self, approver: &str, now_ms: i64) -> PricingResult<()> {
        self.transition(RuleStatus::Draft, RuleStatus::Active, now_ms)?;
        self.approved_by = Some(approver.to_string());
        Ok(())
    }

    /// active → paused
    pub fn pause(&mut self, now_ms: i64) -> PricingResult<()> {
        self.transition(RuleStatus::Active, RuleStatus::Paused, now_ms)
    }

    /// paused → active
    pub fn resume(&mut self, now_ms: i64) -> PricingResult<()> {
        self.transition(RuleStatus::Paused, RuleStatus::Active, now_ms)
    }

    /// any → deleted
    pub fn retire(&mut self, now_ms: i64) {
        if self.status != RuleStatus::Deleted {
            self.status = RuleStatus::Deleted;
            self.touch(now_ms);
        }
    }

    fn transition(&mut self, from: RuleStatus, to: RuleStatus, now_ms: i64) -> PricingResult<()> {
        if self.status != from {
            return Err(PricingError::Validation(format!(
                "Rule {} cannot move from {} to {}",
                self.rule_id, self.status, to
            )));
        }
        self.status = to;
        self.touch(now_ms);
        Ok(())
    }

    /// Load-time invariant checks
    ///
    /// A rule failing these checks never enters a catalog snapshot.
    pub fn validate(&self) -> PricingResult<()> {
        let invalid = |reason: String| PricingError::InvalidRule {
            rule_id: self.rule_id.clone(),
            reason,
        };

        if self.rule_id.trim().is_empty() {
            return Err(invalid("rule_id must not be empty".to_string()));
        }

        let rates = &self.rates;
        if let (Some(min), Some(max)) = (rates.minimum_fare, rates.maximum_fare) {
            if min > max {
                return Err(invalid(format!(
                    "minimum_fare {} exceeds maximum_fare {}",
                    min, max
                )));
            }
        }

        let non_negative = [
            ("base_rate", Some(rates.base_rate)),
            ("per_km_rate", Some(rates.per_km_rate)),
            ("per_minute_rate", Some(rates.per_minute_rate)),
            ("minimum_fare", rates.minimum_fare),
            ("maximum_fare", rates.maximum_fare),
            ("discount_amount", rates.discount_amount),
            ("discount_percent", rates.discount_percent),
            ("max_discount", rates.max_discount),
            ("min_order_amount", rates.min_order_amount),
            ("cancellation_fee", rates.cancellation_fee),
        ];
        for (field, value) in non_negative {
            if let Some(value) = value {
                if value < Decimal::ZERO {
                    return Err(invalid(format!("{} must be non-negative", field)));
                }
            }
        }

        if let Some(percent) = rates.discount_percent {
            if percent > Decimal::ONE_HUNDRED {
                return Err(invalid("discount_percent cannot exceed 100".to_string()));
            }
        }

        if let (Some(started), Some(ended)) = (self.scope.started_at, self.scope.ended_at) {
            if ended < started {
                return Err(invalid(format!(
                    "ended_at {} precedes started_at {}",
                    ended, started
                )));
            }
        }

        if let Some(days) = &self.scope.days_of_week {
            if days.iter().any(|day| !(1..=7).contains(day)) {
                return Err(invalid("days_of_week entries must be 1..=7".to_string()));
            }
        }

        for slot in &self.scope.time_slots {
            if slot.start_hour > 23 || slot.end_hour > 23 || slot.start_minute > 59 || slot.end_minute > 59 {
                return Err(invalid(format!("InvalidTimeSlot: {:?} out of range", slot)));
            }
            if slot.crosses_midnight() {
                return Err(invalid(format!(
                    "InvalidTimeSlot: {:02}:{:02}-{:02}:{:02} crosses midnight",
                    slot.start_hour, slot.start_minute, slot.end_hour, slot.end_minute
                )));
            }
        }

        self.validate_tiers()?;

        let code = &self.code;
        if code.requires_code
            && code.promo_code.as_deref().map_or(true, |c| c.trim().is_empty())
        {
            return Err(invalid("code-gated rule has no promo_code".to_string()));
        }
        if code.requires_code && code.auto_apply {
            return Err(invalid("auto_apply and requires_code are mutually exclusive".to_string()));
        }

        Ok(())
    }

    fn validate_tiers(&self) -> PricingResult<()> {
        let invalid = |reason: String| PricingError::InvalidRule {
            rule_id: self.rule_id.clone(),
            reason,
        };

        if self.rule_type == RuleType::Tiered && self.tiers.is_empty() {
            return Err(invalid("tiered rule has no bands".to_string()));
        }

        for (index, band) in self.tiers.iter().enumerate() {
            if band.rate.is_none() && band.amount.is_none() {
                return Err(invalid(format!("tier band {} has neither rate nor amount", index)));
            }
            match band.upper {
                Some(upper) if upper <= band.lower => {
                    return Err(invalid(format!(
                        "tier band {} has upper {} <= lower {}",
                        index, upper, band.lower
                    )));
                }
                None if index + 1 != self.tiers.len() => {
                    return Err(invalid(format!(
                        "tier band {} is unbounded but not last",
                        index
                    )));
                }
                _ => {}
            }
        }

        for pair in self.tiers.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            // Unbounded bands are already forced to the end above
            if let Some(upper) = current.upper {
                if upper > next.lower {
                    return Err(invalid(format!(
                        "tier bands overlap: [{}, {}) and [{}, ..)",
                        current.lower, upper, next.lower
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Partial update of a rule's editable fields
///
/// Every field left `None` keeps the rule's current value. Counters and
/// lifecycle status are not patchable; they move through the usage accountant
/// and the lifecycle methods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub audit_notes: Option<Option<String>>,
    pub rule_type: Option<RuleType>,
    pub pricing_model: Option<PricingModel>,
    pub discount_type: Option<Option<DiscountType>>,
    pub scope: Option<RuleScope>,
    pub rates: Option<RuleRates>,
    pub tiers: Option<Vec<TierBand>>,
    pub factors: Option<DynamicFactors>,
    pub combination: Option<Combination>,
    pub code: Option<CodeGate>,
    pub apply_on_original: Option<bool>,
    pub max_usage_per_user: Option<Option<i64>>,
    pub max_usage_per_day: Option<Option<i64>>,
    pub max_usage_total: Option<Option<i64>>,
    pub min_distance_km: Option<Option<Decimal>>,
    pub max_distance_km: Option<Option<Decimal>>,
    pub min_duration_min: Option<Option<Decimal>>,
    pub max_duration_min: Option<Option<Decimal>>,
}

impl RulePatch {
    /// Apply onto a copy of `rule`, validate, and bump the version
    pub fn apply(self, rule: &PriceRule, now_ms: i64) -> PricingResult<PriceRule> {
        let mut updated = rule.clone();
        let patch = self;

        apply_present!(updated, patch;
            name, display_name, description, tags, audit_notes, rule_type,
            pricing_model, discount_type, scope, rates, tiers, factors,
            combination, code, apply_on_original,
        );
        apply_present!(updated.limits, patch;
            max_usage_per_user, max_usage_per_day, max_usage_total,
            min_distance_km, max_distance_km, min_duration_min, max_duration_min,
        );

        updated.validate()?;
        updated.touch(now_ms);
        Ok(updated)
    }
}
