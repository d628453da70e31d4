// Decimal helpers for fare arithmetic
//
// Intermediates keep scale 6 with half-even rounding; reported amounts are
// rounded to the currency's scale only at the breakdown boundary.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::pricing::error::{PricingError, PricingResult};

/// Scale kept by every intermediate amount
pub const INTERNAL_SCALE: u32 = 6;

/// Default reporting scale
pub const DISPLAY_SCALE: u32 = 2;

const ROUNDING: RoundingStrategy = RoundingStrategy::MidpointNearestEven;

/// Round an intermediate to scale 6
#[inline]
pub fn internal(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(INTERNAL_SCALE, ROUNDING)
}

/// Reporting scale for a currency (zero-decimal currencies report whole units)
pub fn currency_scale(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "IDR" | "CLP" => 0,
        _ => DISPLAY_SCALE,
    }
}

/// Round to the currency's reporting scale, normalizing trailing zeros
/// so equal amounts always render identically ("23.00", never "23")
pub fn display(value: Decimal, currency: &str) -> Decimal {
    let scale = currency_scale(currency);
    let mut rounded = value.round_dp_with_strategy(scale, ROUNDING);
    rounded.rescale(scale);
    rounded
}

/// Checked multiply, rounded to the internal scale
pub fn mul(a: Decimal, b: Decimal) -> PricingResult<Decimal> {
    a.checked_mul(b)
        .map(internal)
        .ok_or_else(|| PricingError::Internal(format!("decimal overflow computing {} × {}", a, b)))
}

/// Checked add, rounded to the internal scale
pub fn add(a: Decimal, b: Decimal) -> PricingResult<Decimal> {
    a.checked_add(b)
        .map(internal)
        .ok_or_else(|| PricingError::Internal(format!("decimal overflow computing {} + {}", a, b)))
}

/// `amount × percent / 100`
pub fn percent_of(amount: Decimal, percent: Decimal) -> PricingResult<Decimal> {
    let product = mul(amount, percent)?;
    Ok(internal(product / Decimal::ONE_HUNDRED))
}

/// Clamp into `[min, max]`, either bound optional
pub fn clamp(value: Decimal, min: Option<Decimal>, max: Option<Decimal>) -> Decimal {
    let mut clamped = value;
    if let Some(max) = max {
        clamped = clamped.min(max);
    }
    if let Some(min) = min {
        clamped = clamped.max(min);
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_internal_rounds_half_even() {
        assert_eq!(internal(dec!(1.0000005)), dec!(1.000000));
        assert_eq!(internal(dec!(1.0000015)), dec!(1.000002));
    }

    #[test]
    fn test_display_scale_and_rendering() {
        assert_eq!(display(dec!(23), "USD").to_string(), "23.00");
        assert_eq!(display(dec!(34.505), "USD"), dec!(34.50));
        assert_eq!(display(dec!(34.515), "USD"), dec!(34.52));
        assert_eq!(display(dec!(1234.5), "JPY").to_string(), "1234");
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(dec!(34.50), dec!(20)).unwrap(), dec!(6.90));
        assert_eq!(percent_of(dec!(10), dec!(33.333333)).unwrap(), dec!(3.333333));
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(dec!(3), Some(dec!(5)), Some(dec!(200))), dec!(5));
        assert_eq!(clamp(dec!(300), Some(dec!(5)), Some(dec!(200))), dec!(200));
        assert_eq!(clamp(dec!(23), Some(dec!(5)), None), dec!(23));
        assert_eq!(clamp(dec!(23), None, None), dec!(23));
    }

    #[test]
    fn test_mul_overflow_is_internal_error() {
        let result = mul(Decimal::MAX, dec!(2));
        assert!(matches!(result, Err(PricingError::Internal(_))));
    }
}
