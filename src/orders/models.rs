use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use validator::Validate;

use crate::pricing::calculator::{FareBreakdown, FareComponents};
use crate::pricing::context::PricingContext;

/// Order status enum representing the lifecycle of a ride order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Requested,
    Accepted,
    InProgress,
    TripEnded,
    Completed,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Requested => "requested",
            OrderStatus::Accepted => "accepted",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::TripEnded => "trip_ended",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
        }
    }

    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }
}

impl Default for OrderStatus {
    fn default() -> Self {
        OrderStatus::Requested
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requested" => Ok(OrderStatus::Requested),
            "accepted" => Ok(OrderStatus::Accepted),
            "in_progress" => Ok(OrderStatus::InProgress),
            "trip_ended" => Ok(OrderStatus::TripEnded),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "expired" => Ok(OrderStatus::Expired),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

/// Payment status of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    /// Amount fixed, waiting on the payment channel
    Pending,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl Default for PaymentStatus {
    fn default() -> Self {
        PaymentStatus::Unpaid
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    #[default]
    Immediate,
    Scheduled,
}

/// Dispatch bookkeeping; owned by the dispatcher, carried verbatim here
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DispatchInfo {
    pub status: Option<String>,
    pub current_round: i32,
    pub max_rounds: i32,
    pub started_at: Option<i64>,
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub strategy: JsonValue,
}

/// Domain model representing an order
///
/// Monetary fields mirror the bound `fare` so the order can be listed and
/// settled without decoding the breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub version: i64,
    pub order_type: String,
    pub user_id: String,
    pub provider_id: Option<String>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub currency: String,

    pub original_amount: Decimal,
    pub discounted_amount: Decimal,
    pub payment_amount: Decimal,
    pub total_discount_amount: Decimal,
    pub platform_fee: Decimal,
    pub cancellation_fee: Decimal,
    pub promo_discount: Decimal,

    /// Bound fare breakdown and the quote it came from
    pub fare: Option<FareBreakdown>,
    pub quote_id: Option<String>,
    /// Context the bound fare was priced with; re-used to re-price on actuals
    pub pricing_context: Option<PricingContext>,
    pub promo_codes: Vec<String>,
    pub user_promotion_ids: Vec<String>,

    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<i64>,
    /// Deadline after which a still-requested order expires
    pub expires_at: Option<i64>,
    pub accepted_at: Option<i64>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub expired_at: Option<i64>,

    pub cancelled_by: Option<String>,
    pub cancel_reason: Option<String>,

    pub dispatch: DispatchInfo,
    pub metadata: JsonValue,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    /// A freshly requested order with no fare bound
    pub fn requested(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        currency: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            version: 1,
            order_type: "ride".to_string(),
            user_id: user_id.into(),
            provider_id: None,
            status: OrderStatus::Requested,
            payment_status: PaymentStatus::Unpaid,
            currency: currency.into(),
            original_amount: Decimal::ZERO,
            discounted_amount: Decimal::ZERO,
            payment_amount: Decimal::ZERO,
            total_discount_amount: Decimal::ZERO,
            platform_fee: Decimal::ZERO,
            cancellation_fee: Decimal::ZERO,
            promo_discount: Decimal::ZERO,
            fare: None,
            quote_id: None,
            pricing_context: None,
            promo_codes: Vec::new(),
            user_promotion_ids: Vec::new(),
            schedule_type: ScheduleType::Immediate,
            scheduled_at: None,
            expires_at: None,
            accepted_at: None,
            started_at: None,
            ended_at: None,
            completed_at: None,
            cancelled_at: None,
            expired_at: None,
            cancelled_by: None,
            cancel_reason: None,
            dispatch: DispatchInfo::default(),
            metadata: JsonValue::Null,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Copy a breakdown onto the order's monetary fields
    ///
    /// `promo_rule_ids` are the rules that came in through a promo code; their
    /// amounts make up `promo_discount`.
    pub fn bind_fare(&mut self, breakdown: &FareBreakdown, promo_rule_ids: &[String]) {
        self.currency = breakdown.currency.clone();
        self.original_amount = breakdown.original_amount;
        self.discounted_amount = breakdown.discounted_amount;
        self.payment_amount = breakdown.payment_amount;
        self.total_discount_amount = breakdown.total_discount;
        self.platform_fee = breakdown.platform_fee;
        self.promo_discount = breakdown
            .applied_rules
            .iter()
            .filter(|applied| promo_rule_ids.contains(&applied.rule_id))
            .map(|applied| applied.amount)
            .sum();
        self.fare = Some(breakdown.clone());
    }
}

/// Pickup or dropoff point
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate)]
pub struct Location {
    pub address: String,
    #[validate(custom = "validate_latitude")]
    pub lat: Decimal,
    #[validate(custom = "validate_longitude")]
    pub lng: Decimal,
    pub landmark: Option<String>,
}

fn validate_latitude(value: &Decimal) -> Result<(), validator::ValidationError> {
    if value.abs() <= Decimal::from(90) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("latitude_out_of_range"))
    }
}

fn validate_longitude(value: &Decimal) -> Result<(), validator::ValidationError> {
    if value.abs() <= Decimal::from(180) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("longitude_out_of_range"))
    }
}

/// Ride fare terms shown to rider and driver
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RideFare {
    pub base: Decimal,
    pub distance: Decimal,
    pub time: Decimal,
    pub surge: Decimal,
    /// base + distance + time + surge
    pub total: Decimal,
}

impl RideFare {
    pub fn from_breakdown(breakdown: &FareBreakdown) -> Self {
        let FareComponents {
            base,
            distance,
            time,
            surge,
        } = breakdown.components.clone();
        Self {
            base,
            distance,
            time,
            surge,
            total: breakdown.surged_amount,
        }
    }
}

/// Ride-specific part of an order (1:1 when `order_type = ride`)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RideOrderDetail {
    pub order_id: String,
    pub vehicle_id: Option<String>,
    pub vehicle_category: Option<String>,
    pub vehicle_level: Option<String>,
    pub passenger_count: i32,
    pub pickup: Location,
    pub dropoff: Location,
    pub estimated_distance_km: Decimal,
    pub estimated_duration_min: Decimal,
    pub actual_distance_km: Option<Decimal>,
    pub actual_duration_min: Option<Decimal>,
    pub fare: RideFare,
    pub driver_en_route_at: Option<i64>,
    pub driver_arrived_at: Option<i64>,
    pub route: JsonValue,
}

/// Request DTO for creating a ride order
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewRideOrder {
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,
    #[validate(length(min = 1, message = "user_id is required"))]
    pub user_id: String,
    #[validate(length(equal = 3, message = "currency must be an ISO code"))]
    pub currency: String,
    pub vehicle_category: Option<String>,
    pub vehicle_level: Option<String>,
    #[validate(range(min = 1, max = 8, message = "passenger_count must be 1..=8"))]
    pub passenger_count: i32,
    #[validate]
    pub pickup: Location,
    #[validate]
    pub dropoff: Location,
    pub estimated_distance_km: Decimal,
    pub estimated_duration_min: Decimal,
    pub scheduled_at: Option<i64>,
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Partial update of the non-fare order fields
///
/// Fare and status fields only change through the binder's lifecycle
/// operations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderPatch {
    pub provider_id: Option<Option<String>>,
    pub scheduled_at: Option<Option<i64>>,
    pub expires_at: Option<Option<i64>>,
    pub user_promotion_ids: Option<Vec<String>>,
    pub dispatch: Option<DispatchInfo>,
    pub metadata: Option<JsonValue>,
}

impl OrderPatch {
    pub fn is_empty(&self) -> bool {
        self.provider_id.is_none()
            && self.scheduled_at.is_none()
            && self.expires_at.is_none()
            && self.user_promotion_ids.is_none()
            && self.dispatch.is_none()
            && self.metadata.is_none()
    }

    /// Copy every present field onto `order`
    pub fn apply_to(self, order: &mut Order) {
        apply_present!(order, self;
            provider_id,
            scheduled_at,
            expires_at,
            user_promotion_ids,
            dispatch,
            metadata,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::calculator::AppliedRule;
    use crate::pricing::types::RuleCategory;
    use rust_decimal_macros::dec;

    fn breakdown() -> FareBreakdown {
        let applied = |id: &str, category, amount| AppliedRule {
            rule_id: id.to_string(),
            category,
            amount,
        };
        FareBreakdown {
            currency: "USD".to_string(),
            components: FareComponents {
                base: dec!(3.00),
                distance: dec!(15.00),
                time: dec!(5.00),
                surge: dec!(11.50),
            },
            original_amount: dec!(23.00),
            surged_amount: dec!(34.50),
            total_discount: dec!(11.90),
            platform_fee: dec!(2.00),
            discounted_amount: dec!(22.60),
            payment_amount: dec!(24.60),
            applied_rules: vec![
                applied("base", RuleCategory::BasePricing, dec!(23.00)),
                applied("surge", RuleCategory::SurgePricing, dec!(11.50)),
                applied("auto", RuleCategory::Discount, dec!(6.90)),
                applied("code", RuleCategory::Promotion, dec!(5.00)),
            ],
            warnings: vec![],
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            OrderStatus::Requested,
            OrderStatus::InProgress,
            OrderStatus::TripEnded,
            OrderStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("pending".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_bind_fare_mirrors_breakdown() {
        let mut order = Order::requested("o-1", "u-1", "USD", 0);
        let fare = breakdown();
        order.bind_fare(&fare, &["code".to_string()]);

        assert_eq!(order.original_amount, dec!(23.00));
        assert_eq!(order.discounted_amount, dec!(22.60));
        assert_eq!(order.payment_amount, dec!(24.60));
        assert_eq!(order.total_discount_amount, dec!(11.90));
        assert_eq!(order.promo_discount, dec!(5.00));
        assert_eq!(order.fare.as_ref(), Some(&fare));
    }

    #[test]
    fn test_ride_fare_total_is_surged_amount() {
        let fare = RideFare::from_breakdown(&breakdown());
        assert_eq!(fare.base + fare.distance + fare.time + fare.surge, fare.total);
    }

    #[test]
    fn test_patch_applies_present_fields_only() {
        let mut order = Order::requested("o-1", "u-1", "USD", 0);
        order.scheduled_at = Some(10);

        let patch = OrderPatch {
            provider_id: Some(Some("driver-9".to_string())),
            metadata: Some(serde_json::json!({"channel": "app"})),
            ..OrderPatch::default()
        };
        assert!(!patch.is_empty());
        patch.apply_to(&mut order);

        assert_eq!(order.provider_id.as_deref(), Some("driver-9"));
        assert_eq!(order.scheduled_at, Some(10));
        assert_eq!(order.metadata["channel"], "app");
    }

    #[test]
    fn test_location_validation() {
        let location = Location {
            address: "Main St".to_string(),
            lat: dec!(91),
            lng: dec!(0),
            landmark: None,
        };
        assert!(location.validate().is_err());
    }
}
