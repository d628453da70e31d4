// Error types for the pricing engine
// Covers catalog loading, rule validation, quoting and usage accounting

use std::time::Duration;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Main error type for the pricing engine
///
/// Quote computation never fails because a rule is not eligible; ineligible
/// rules are filtered and reported as warnings. These variants are reserved
/// for malformed input, unreachable backends and broken invariants.
#[derive(Debug, Error)]
pub enum PricingError {
    /// Pricing context out of range or malformed promo code
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Rule id not present in the catalog or the store
    #[error("Price rule not found: {0}")]
    RuleNotFound(String),

    /// Quote id unknown or already evicted
    #[error("Quote not found: {0}")]
    QuoteNotFound(String),

    /// The catalog has never loaded successfully
    #[error("Rule catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// A persisted rule violates a load-time invariant
    #[error("Invalid price rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// Reserving usage would push a counter past its cap
    #[error("Usage quota exceeded for rule {rule_id}")]
    QuotaExceeded { rule_id: String },

    /// Optimistic lock miss on a rule edit
    #[error("Price rule {0} was modified concurrently")]
    VersionConflict(String),

    /// Database operation errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON column could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other backend (cache, store) failure
    #[error("Backend unavailable: {0}")]
    Backend(String),

    /// Arithmetic or plan invariant violated during evaluation
    #[error("Internal pricing error: {0}")]
    Internal(String),
}

/// Result type alias for pricing operations
pub type PricingResult<T> = Result<T, PricingError>;

impl From<validator::ValidationErrors> for PricingError {
    fn from(err: validator::ValidationErrors) -> Self {
        PricingError::Validation(err.to_string())
    }
}

impl Classify for PricingError {
    fn kind(&self) -> ErrorKind {
        match self {
            PricingError::Validation(_) => ErrorKind::Validation,
            PricingError::RuleNotFound(_) | PricingError::QuoteNotFound(_) => ErrorKind::NotFound,
            PricingError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            PricingError::VersionConflict(_) => ErrorKind::VersionConflict,
            PricingError::CatalogUnavailable(_)
            | PricingError::Database(_)
            | PricingError::Backend(_) => ErrorKind::BackendUnavailable,
            PricingError::InvalidRule { .. } | PricingError::Json(_) | PricingError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self.kind() {
            ErrorKind::BackendUnavailable => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}
