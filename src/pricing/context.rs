// Pricing context
// Everything a quote needs to evaluate rule predicates, validated on entry

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::pricing::error::{PricingError, PricingResult};

fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        Err(ValidationError::new("must_be_non_negative"))
    } else {
        Ok(())
    }
}

fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_currency_code"))
    }
}

/// Prospective ride described for pricing
///
/// Local calendar fields are supplied by the caller; the engine does no
/// timezone arithmetic of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PricingContext {
    #[validate(length(min = 1, message = "user_id is required"))]
    pub user_id: String,
    #[serde(default)]
    pub user_segments: Vec<String>,
    #[validate(length(min = 1, message = "order_type is required"))]
    pub order_type: String,
    pub vehicle_category: Option<String>,
    pub vehicle_level: Option<String>,
    pub service_area_id: Option<String>,
    /// Epoch milliseconds
    #[validate(range(min = 0, message = "now_ms must be non-negative"))]
    pub now_ms: i64,
    /// ISO day number, 1 = Monday .. 7 = Sunday
    #[validate(range(min = 1, max = 7, message = "local_day_of_week must be 1..=7"))]
    pub local_day_of_week: u8,
    #[validate(range(max = 23, message = "local_hour must be 0..=23"))]
    pub local_hour: u8,
    #[validate(range(max = 59, message = "local_minute must be 0..=59"))]
    pub local_minute: u8,
    /// Calendar date for date-based predicates; UTC date of `now_ms` when absent
    pub local_date: Option<NaiveDate>,
    #[validate(custom = "validate_non_negative")]
    pub distance_km: Decimal,
    #[validate(custom = "validate_non_negative")]
    pub duration_min: Decimal,
    #[validate(custom = "validate_non_negative")]
    pub original_amount: Option<Decimal>,
    #[validate(custom = "validate_currency")]
    pub currency: String,
    #[validate(custom = "validate_non_negative")]
    pub platform_fee: Option<Decimal>,
    /// Rules the caller wants left out of this quote
    #[serde(default)]
    pub excluded_rule_ids: Vec<String>,
}

impl PricingContext {
    /// Context for a standard ride at `now_ms`, with local fields taken from UTC
    pub fn new(
        user_id: impl Into<String>,
        distance_km: Decimal,
        duration_min: Decimal,
        now_ms: i64,
    ) -> Self {
        let mut ctx = Self {
            user_id: user_id.into(),
            user_segments: Vec::new(),
            order_type: "ride".to_string(),
            vehicle_category: None,
            vehicle_level: None,
            service_area_id: None,
            now_ms,
            local_day_of_week: 1,
            local_hour: 0,
            local_minute: 0,
            local_date: None,
            distance_km,
            duration_min,
            original_amount: None,
            currency: "USD".to_string(),
            platform_fee: None,
            excluded_rule_ids: Vec::new(),
        };
        if let Some(utc) = DateTime::<Utc>::from_timestamp_millis(now_ms) {
            ctx.local_day_of_week = utc.weekday().number_from_monday() as u8;
            ctx.local_hour = utc.hour() as u8;
            ctx.local_minute = utc.minute() as u8;
        }
        ctx
    }

    /// Override the local wall-clock fields
    pub fn at_local(mut self, day_of_week: u8, hour: u8, minute: u8) -> Self {
        self.local_day_of_week = day_of_week;
        self.local_hour = hour;
        self.local_minute = minute;
        self
    }

    /// Run the derive checks, mapping failures to a pricing validation error
    pub fn check(&self) -> PricingResult<()> {
        self.validate().map_err(PricingError::from)
    }

    pub fn minute_of_day(&self) -> u16 {
        self.local_hour as u16 * 60 + self.local_minute as u16
    }

    /// Date used by date predicates and daily counters
    pub fn today(&self) -> NaiveDate {
        self.local_date.unwrap_or_else(|| {
            DateTime::<Utc>::from_timestamp_millis(self.now_ms)
                .map(|utc| utc.date_naive())
                .unwrap_or_default()
        })
    }

    pub fn is_excluded(&self, rule_id: &str) -> bool {
        self.excluded_rule_ids.iter().any(|id| id == rule_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // 2026-03-14T09:30:00Z, a Saturday
    const SATURDAY_0930: i64 = 1_773_480_600_000;

    #[test]
    fn test_new_derives_local_fields_from_utc() {
        let ctx = PricingContext::new("u-1", dec!(10), dec!(20), SATURDAY_0930);
        assert_eq!(ctx.local_day_of_week, 6);
        assert_eq!(ctx.local_hour, 9);
        assert_eq!(ctx.local_minute, 30);
        assert_eq!(ctx.minute_of_day(), 570);
        assert_eq!(ctx.today(), NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
    }

    #[test]
    fn test_local_date_overrides_utc_date() {
        let mut ctx = PricingContext::new("u-1", dec!(1), dec!(1), SATURDAY_0930);
        let local = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        ctx.local_date = Some(local);
        assert_eq!(ctx.today(), local);
    }

    #[test]
    fn test_valid_context_passes() {
        let ctx = PricingContext::new("u-1", dec!(10), dec!(20), SATURDAY_0930);
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_negative_distance_rejected() {
        let ctx = PricingContext::new("u-1", dec!(-1), dec!(20), SATURDAY_0930);
        assert!(matches!(ctx.check(), Err(PricingError::Validation(_))));
    }

    #[test]
    fn test_out_of_range_local_fields_rejected() {
        let ctx = PricingContext::new("u-1", dec!(1), dec!(1), SATURDAY_0930).at_local(8, 9, 0);
        assert!(ctx.check().is_err());

        let ctx = PricingContext::new("u-1", dec!(1), dec!(1), SATURDAY_0930).at_local(1, 24, 0);
        assert!(ctx.check().is_err());
    }

    #[test]
    fn test_bad_currency_rejected() {
        let mut ctx = PricingContext::new("u-1", dec!(1), dec!(1), SATURDAY_0930);
        ctx.currency = "US".to_string();
        assert!(ctx.check().is_err());
    }

    #[test]
    fn test_empty_user_rejected() {
        let ctx = PricingContext::new("", dec!(1), dec!(1), SATURDAY_0930);
        assert!(ctx.check().is_err());
    }
}
