// Domain type definitions for the pricing engine
// Classification enums shared by the rule model, the combiner and the calculator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rule category
///
/// Determines which stage of the application plan a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    /// Base fare: base + per-km + per-minute, or tiered
    BasePricing,

    /// Multiplicative uplift applied after the base fare
    SurgePricing,

    /// Plain discount
    Discount,

    /// Marketing promotion, usually code-gated
    Promotion,

    /// Limited special offer
    SpecialOffer,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::BasePricing => "base_pricing",
            RuleCategory::SurgePricing => "surge_pricing",
            RuleCategory::Discount => "discount",
            RuleCategory::Promotion => "promotion",
            RuleCategory::SpecialOffer => "special_offer",
        }
    }

    /// Discount, promotion and special offer rules reduce the fare
    pub fn is_discount_family(&self) -> bool {
        matches!(
            self,
            RuleCategory::Discount | RuleCategory::Promotion | RuleCategory::SpecialOffer
        )
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base_pricing" => Ok(RuleCategory::BasePricing),
            "surge_pricing" => Ok(RuleCategory::SurgePricing),
            "discount" => Ok(RuleCategory::Discount),
            "promotion" => Ok(RuleCategory::Promotion),
            "special_offer" => Ok(RuleCategory::SpecialOffer),
            _ => Err(format!("Invalid rule category: {}", s)),
        }
    }
}

/// How a rule's numeric fields are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Percentage,
    FixedAmount,
    Multiplier,
    Tiered,
    Custom,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Percentage => "percentage",
            RuleType::FixedAmount => "fixed_amount",
            RuleType::Multiplier => "multiplier",
            RuleType::Tiered => "tiered",
            RuleType::Custom => "custom",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(RuleType::Percentage),
            "fixed_amount" => Ok(RuleType::FixedAmount),
            "multiplier" => Ok(RuleType::Multiplier),
            "tiered" => Ok(RuleType::Tiered),
            "custom" => Ok(RuleType::Custom),
            _ => Err(format!("Invalid rule type: {}", s)),
        }
    }
}

/// Which scalar a base-pricing rule is driven by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    DistanceBased,
    TimeBased,
    FixedRate,
    Dynamic,
}

impl PricingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingModel::DistanceBased => "distance_based",
            PricingModel::TimeBased => "time_based",
            PricingModel::FixedRate => "fixed_rate",
            PricingModel::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for PricingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PricingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "distance_based" => Ok(PricingModel::DistanceBased),
            "time_based" => Ok(PricingModel::TimeBased),
            "fixed_rate" => Ok(PricingModel::FixedRate),
            "dynamic" => Ok(PricingModel::Dynamic),
            _ => Err(format!("Invalid pricing model: {}", s)),
        }
    }
}

/// Type of discount a rule grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
    BuyXGetY,
    FreeDelivery,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
            DiscountType::BuyXGetY => "buy_x_get_y",
            DiscountType::FreeDelivery => "free_delivery",
        }
    }
}

impl fmt::Display for DiscountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(DiscountType::Percentage),
            "fixed" => Ok(DiscountType::Fixed),
            "buy_x_get_y" => Ok(DiscountType::BuyXGetY),
            "free_delivery" => Ok(DiscountType::FreeDelivery),
            _ => Err(format!("Invalid discount type: {}", s)),
        }
    }
}

/// Rule lifecycle status
///
/// draft → active (approval) ⇄ paused; active → expired once the window closes
/// or the total usage cap is reached; any → deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Expired,
    Deleted,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Draft => "draft",
            RuleStatus::Active => "active",
            RuleStatus::Paused => "paused",
            RuleStatus::Expired => "expired",
            RuleStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(RuleStatus::Draft),
            "active" => Ok(RuleStatus::Active),
            "paused" => Ok(RuleStatus::Paused),
            "expired" => Ok(RuleStatus::Expired),
            "deleted" => Ok(RuleStatus::Deleted),
            _ => Err(format!("Invalid rule status: {}", s)),
        }
    }
}
