// Price rule persistence
//
// `RuleStore` is the seam the catalog and the admin operations use; the
// Postgres implementation maps `price_rules` rows, with list-valued facets
// stored as JSONB columns.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::Postgres;
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder};
use std::time::Duration;

use crate::db;
use crate::pricing::error::{PricingError, PricingResult};
use crate::pricing::rule::{
    CodeGate, Combination, DynamicFactors, PriceRule, RuleRates, RuleScope, TierBand, TimeSlot,
    UsageLimits, VehicleFilter,
};
use crate::pricing::types::{DiscountType, PricingModel, RuleCategory, RuleStatus, RuleType};

/// Persistence seam for price rules
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Every rule that is not deleted
    async fn load_rules(&self) -> PricingResult<Vec<PriceRule>>;

    /// One rule by id, deleted rules included
    async fn get_rule(&self, rule_id: &str) -> PricingResult<Option<PriceRule>>;

    /// Insert a new rule; an existing id is a validation error
    async fn insert_rule(&self, rule: &PriceRule) -> PricingResult<()>;

    /// Persist an edit made on top of `expected_version`
    ///
    /// Usage counters are owned by the usage accountant and never written
    /// here. A stale `expected_version` is a `VersionConflict`.
    async fn update_rule(&self, rule: &PriceRule, expected_version: i64) -> PricingResult<()>;
}

/// Columns written by edits, in bind order
const EDITABLE_COLUMNS: &str = "version, name, display_name, description, tags, metadata, \
    created_by, approved_by, created_at, updated_at, audit_notes, \
    category, rule_type, pricing_model, discount_type, \
    vehicle_filters, service_areas, user_segments, order_types, days_of_week, time_slots, \
    excluded_dates, included_dates, started_at, ended_at, timezone, \
    base_rate, per_km_rate, per_minute_rate, minimum_fare, maximum_fare, \
    discount_amount, discount_percent, surge_multiplier, max_discount, min_order_amount, \
    cancellation_fee, tiers, dynamic_factors, \
    max_usage_per_user, max_usage_per_day, max_usage_total, \
    min_distance_km, max_distance_km, min_duration_min, max_duration_min, \
    priority, stackable_rules, exclusive_rules, \
    requires_code, promo_code, case_sensitive, auto_apply, is_global, \
    apply_on_original, status";

/// Counter columns, written only on insert
const COUNTER_COLUMNS: &str = "usage_count, usage_today, usage_day";

const SELECT_RULE: &str = r#"
    SELECT rule_id, version, name, display_name, description, tags, metadata,
           created_by, approved_by, created_at, updated_at, audit_notes,
           category, rule_type, pricing_model, discount_type,
           vehicle_filters, service_areas, user_segments, order_types, days_of_week, time_slots,
           excluded_dates, included_dates, started_at, ended_at, timezone,
           base_rate, per_km_rate, per_minute_rate, minimum_fare, maximum_fare,
           discount_amount, discount_percent, surge_multiplier, max_discount, min_order_amount,
           cancellation_fee, tiers, dynamic_factors,
           max_usage_per_user, max_usage_per_day, max_usage_total,
           usage_count, usage_today, usage_day,
           min_distance_km, max_distance_km, min_duration_min, max_duration_min,
           priority, stackable_rules, exclusive_rules,
           requires_code, promo_code, case_sensitive, auto_apply, is_global,
           apply_on_original, status
    FROM price_rules
"#;

/// Raw `price_rules` row
#[derive(Debug, sqlx::FromRow)]
pub struct PriceRuleRow {
    pub rule_id: String,
    pub version: i64,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub tags: Option<Json<Vec<String>>>,
    pub metadata: Option<JsonValue>,
    pub created_by: Option<String>,
    pub approved_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub audit_notes: Option<String>,
    pub category: RuleCategory,
    pub rule_type: RuleType,
    pub pricing_model: PricingModel,
    pub discount_type: Option<DiscountType>,
    pub vehicle_filters: Option<Json<Vec<VehicleFilter>>>,
    pub service_areas: Option<Json<Vec<String>>>,
    pub user_segments: Option<Json<Vec<String>>>,
    pub order_types: Option<Json<Vec<String>>>,
    pub days_of_week: Option<Json<Vec<u8>>>,
    pub time_slots: Option<Json<Vec<TimeSlot>>>,
    pub excluded_dates: Option<Json<Vec<NaiveDate>>>,
    pub included_dates: Option<Json<Vec<NaiveDate>>>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub timezone: Option<String>,
    pub base_rate: Option<Decimal>,
    pub per_km_rate: Option<Decimal>,
    pub per_minute_rate: Option<Decimal>,
    pub minimum_fare: Option<Decimal>,
    pub maximum_fare: Option<Decimal>,
    pub discount_amount: Option<Decimal>,
    pub discount_percent: Option<Decimal>,
    pub surge_multiplier: Option<Decimal>,
    pub max_discount: Option<Decimal>,
    pub min_order_amount: Option<Decimal>,
    pub cancellation_fee: Option<Decimal>,
    pub tiers: Option<Json<Vec<TierBand>>>,
    pub dynamic_factors: Option<Json<DynamicFactors>>,
    pub max_usage_per_user: Option<i64>,
    pub max_usage_per_day: Option<i64>,
    pub max_usage_total: Option<i64>,
    pub usage_count: Option<i64>,
    pub usage_today: Option<i64>,
    pub usage_day: Option<NaiveDate>,
    pub min_distance_km: Option<Decimal>,
    pub max_distance_km: Option<Decimal>,
    pub min_duration_min: Option<Decimal>,
    pub max_duration_min: Option<Decimal>,
    pub priority: i32,
    pub stackable_rules: Option<Json<Vec<String>>>,
    pub exclusive_rules: Option<Json<Vec<String>>>,
    pub requires_code: bool,
    pub promo_code: Option<String>,
    pub case_sensitive: bool,
    pub auto_apply: bool,
    pub is_global: bool,
    pub apply_on_original: bool,
    pub status: RuleStatus,
}

fn list<T>(column: Option<Json<Vec<T>>>) -> Vec<T> {
    column.map(|Json(values)| values).unwrap_or_default()
}

impl From<PriceRuleRow> for PriceRule {
    /// NULL columns resolve to their defaults here and nowhere else
    fn from(row: PriceRuleRow) -> Self {
        PriceRule {
            rule_id: row.rule_id,
            version: row.version,
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            tags: list(row.tags),
            metadata: row.metadata.unwrap_or(JsonValue::Null),
            created_by: row.created_by,
            approved_by: row.approved_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            audit_notes: row.audit_notes,
            category: row.category,
            rule_type: row.rule_type,
            pricing_model: row.pricing_model,
            discount_type: row.discount_type,
            scope: RuleScope {
                vehicle_filters: list(row.vehicle_filters),
                service_areas: list(row.service_areas),
                user_segments: list(row.user_segments),
                order_types: list(row.order_types),
                days_of_week: row.days_of_week.map(|Json(days)| days),
                time_slots: list(row.time_slots),
                excluded_dates: list(row.excluded_dates),
                included_dates: list(row.included_dates),
                started_at: row.started_at,
                ended_at: row.ended_at,
                timezone: row.timezone,
            },
            rates: RuleRates {
                base_rate: row.base_rate.unwrap_or_default(),
                per_km_rate: row.per_km_rate.unwrap_or_default(),
                per_minute_rate: row.per_minute_rate.unwrap_or_default(),
                minimum_fare: row.minimum_fare,
                maximum_fare: row.maximum_fare,
                discount_amount: row.discount_amount,
                discount_percent: row.discount_percent,
                surge_multiplier: row.surge_multiplier,
                max_discount: row.max_discount,
                min_order_amount: row.min_order_amount,
                cancellation_fee: row.cancellation_fee,
            },
            tiers: list(row.tiers),
            factors: row
                .dynamic_factors
                .map(|Json(factors)| factors)
                .unwrap_or_default(),
            limits: UsageLimits {
                max_usage_per_user: row.max_usage_per_user,
                max_usage_per_day: row.max_usage_per_day,
                max_usage_total: row.max_usage_total,
                usage_count: row.usage_count.unwrap_or(0),
                usage_today: row.usage_today.unwrap_or(0),
                usage_day: row.usage_day,
                min_distance_km: row.min_distance_km,
                max_distance_km: row.max_distance_km,
                min_duration_min: row.min_duration_min,
                max_duration_min: row.max_duration_min,
            },
            combination: Combination {
                priority: row.priority,
                stackable_rules: list(row.stackable_rules),
                exclusive_rules: list(row.exclusive_rules),
            },
            code: CodeGate {
                requires_code: row.requires_code,
                promo_code: row.promo_code,
                case_sensitive: row.case_sensitive,
                auto_apply: row.auto_apply,
                is_global: row.is_global,
            },
            apply_on_original: row.apply_on_original,
            status: row.status,
        }
    }
}

/// Bind every `EDITABLE_COLUMNS` value, in order
fn push_editable(values: &mut Separated<'_, '_, Postgres, &'static str>, rule: &PriceRule) {
    let scope = &rule.scope;
    let rates = &rule.rates;
    let limits = &rule.limits;

    values
        .push_bind(rule.version)
        .push_bind(rule.name.clone())
        .push_bind(rule.display_name.clone())
        .push_bind(rule.description.clone())
        .push_bind(Json(rule.tags.clone()))
        .push_bind(rule.metadata.clone())
        .push_bind(rule.created_by.clone())
        .push_bind(rule.approved_by.clone())
        .push_bind(rule.created_at)
        .push_bind(rule.updated_at)
        .push_bind(rule.audit_notes.clone())
        .push_bind(rule.category)
        .push_bind(rule.rule_type)
        .push_bind(rule.pricing_model)
        .push_bind(rule.discount_type)
        .push_bind(Json(scope.vehicle_filters.clone()))
        .push_bind(Json(scope.service_areas.clone()))
        .push_bind(Json(scope.user_segments.clone()))
        .push_bind(Json(scope.order_types.clone()))
        .push_bind(scope.days_of_week.clone().map(Json))
        .push_bind(Json(scope.time_slots.clone()))
        .push_bind(Json(scope.excluded_dates.clone()))
        .push_bind(Json(scope.included_dates.clone()))
        .push_bind(scope.started_at)
        .push_bind(scope.ended_at)
        .push_bind(scope.timezone.clone())
        .push_bind(rates.base_rate)
        .push_bind(rates.per_km_rate)
        .push_bind(rates.per_minute_rate)
        .push_bind(rates.minimum_fare)
        .push_bind(rates.maximum_fare)
        .push_bind(rates.discount_amount)
        .push_bind(rates.discount_percent)
        .push_bind(rates.surge_multiplier)
        .push_bind(rates.max_discount)
        .push_bind(rates.min_order_amount)
        .push_bind(rates.cancellation_fee)
        .push_bind(Json(rule.tiers.clone()))
        .push_bind(Json(rule.factors.clone()))
        .push_bind(limits.max_usage_per_user)
        .push_bind(limits.max_usage_per_day)
        .push_bind(limits.max_usage_total)
        .push_bind(limits.min_distance_km)
        .push_bind(limits.max_distance_km)
        .push_bind(limits.min_duration_min)
        .push_bind(limits.max_duration_min)
        .push_bind(rule.combination.priority)
        .push_bind(Json(rule.combination.stackable_rules.clone()))
        .push_bind(Json(rule.combination.exclusive_rules.clone()))
        .push_bind(rule.code.requires_code)
        .push_bind(rule.code.promo_code.clone())
        .push_bind(rule.code.case_sensitive)
        .push_bind(rule.code.auto_apply)
        .push_bind(rule.code.is_global)
        .push_bind(rule.apply_on_original)
        .push_bind(rule.status);
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map_or(false, |code| code == "23505"),
        _ => false,
    }
}

/// Postgres-backed rule store
#[derive(Clone)]
pub struct PgRuleStore {
    pool: PgPool,
    deadline: Duration,
}

impl PgRuleStore {
    pub fn new(pool: PgPool, deadline: Duration) -> Self {
        Self { pool, deadline }
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn load_rules(&self) -> PricingResult<Vec<PriceRule>> {
        let sql = format!("{} WHERE status <> 'deleted' ORDER BY priority, rule_id", SELECT_RULE);
        let rows = db::bounded(self.deadline, || {
            sqlx::query_as::<_, PriceRuleRow>(&sql).fetch_all(&self.pool)
        })
        .await?;

        tracing::debug!("Loaded {} price rule rows", rows.len());
        Ok(rows.into_iter().map(PriceRule::from).collect())
    }

    async fn get_rule(&self, rule_id: &str) -> PricingResult<Option<PriceRule>> {
        let sql = format!("{} WHERE rule_id = $1", SELECT_RULE);
        let row = db::bounded(self.deadline, || {
            sqlx::query_as::<_, PriceRuleRow>(&sql)
                .bind(rule_id)
                .fetch_optional(&self.pool)
        })
        .await?;

        Ok(row.map(PriceRule::from))
    }

    async fn insert_rule(&self, rule: &PriceRule) -> PricingResult<()> {
        let result = db::bounded(self.deadline, || {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("INSERT INTO price_rules (rule_id, ");
            builder.push(EDITABLE_COLUMNS);
            builder.push(", ");
            builder.push(COUNTER_COLUMNS);
            builder.push(") VALUES (");
            {
                let mut values = builder.separated(", ");
                values.push_bind(rule.rule_id.clone());
                push_editable(&mut values, rule);
                values
                    .push_bind(rule.limits.usage_count)
                    .push_bind(rule.limits.usage_today)
                    .push_bind(rule.limits.usage_day);
            }
            builder.push(")");
            async move { builder.build().execute(&self.pool).await }
        })
        .await;

        match result {
            Ok(_) => {
                tracing::info!("Inserted price rule {}", rule.rule_id);
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => Err(PricingError::Validation(format!(
                "Price rule {} already exists",
                rule.rule_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_rule(&self, rule: &PriceRule, expected_version: i64) -> PricingResult<()> {
        let result = db::bounded(self.deadline, || {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE price_rules SET (");
            builder.push(EDITABLE_COLUMNS);
            builder.push(") = (");
            {
                let mut values = builder.separated(", ");
                push_editable(&mut values, rule);
            }
            builder.push(") WHERE rule_id = ");
            builder.push_bind(rule.rule_id.clone());
            builder.push(" AND version = ");
            builder.push_bind(expected_version);
            async move { builder.build().execute(&self.pool).await }
        })
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_rule(&rule.rule_id).await? {
                Some(_) => Err(PricingError::VersionConflict(rule.rule_id.clone())),
                None => Err(PricingError::RuleNotFound(rule.rule_id.clone())),
            };
        }

        tracing::info!("Updated price rule {} to version {}", rule.rule_id, rule.version);
        Ok(())
    }
}
