use std::time::Duration;

use crate::error::{Classify, ErrorKind};
use crate::pricing::error::PricingError;

/// Retry hint attached to backend failures on write paths
pub const BACKEND_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Error types for order operations
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Order {0} was modified concurrently")]
    VersionConflict(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Quote expired: {0}")]
    QuoteExpired(String),

    #[error("Usage quota exceeded for rule {rule_id}")]
    QuotaExceeded { rule_id: String },

    #[error("Backend unavailable: {message}")]
    Backend {
        message: String,
        retry_after: Duration,
    },

    #[error("Internal order error: {0}")]
    Internal(String),

    #[error(transparent)]
    Pricing(PricingError),
}

/// Result type alias for order operations
pub type OrderResult<T> = Result<T, OrderError>;

impl OrderError {
    pub fn backend(message: impl Into<String>) -> Self {
        OrderError::Backend {
            message: message.into(),
            retry_after: BACKEND_RETRY_AFTER,
        }
    }
}

impl From<sqlx::Error> for OrderError {
    fn from(err: sqlx::Error) -> Self {
        OrderError::backend(err.to_string())
    }
}

impl From<serde_json::Error> for OrderError {
    fn from(err: serde_json::Error) -> Self {
        OrderError::Internal(err.to_string())
    }
}

impl From<validator::ValidationErrors> for OrderError {
    fn from(err: validator::ValidationErrors) -> Self {
        OrderError::Validation(err.to_string())
    }
}

/// Quota misses keep their own variant so the binder can recompute
impl From<PricingError> for OrderError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::QuotaExceeded { rule_id } => OrderError::QuotaExceeded { rule_id },
            PricingError::Database(db_err) => OrderError::from(db_err),
            other => OrderError::Pricing(other),
        }
    }
}

impl Classify for OrderError {
    fn kind(&self) -> ErrorKind {
        match self {
            OrderError::Validation(_)
            | OrderError::InvalidTransition(_)
            | OrderError::QuoteExpired(_) => ErrorKind::Validation,
            OrderError::NotFound(_) => ErrorKind::NotFound,
            OrderError::VersionConflict(_) => ErrorKind::VersionConflict,
            OrderError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            OrderError::Backend { .. } => ErrorKind::BackendUnavailable,
            OrderError::Internal(_) => ErrorKind::Internal,
            OrderError::Pricing(err) => err.kind(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            OrderError::Backend { retry_after, .. } => Some(*retry_after),
            OrderError::Pricing(err) => err.retry_after(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_keeps_rule_id() {
        let err: OrderError = PricingError::QuotaExceeded {
            rule_id: "promo".to_string(),
        }
        .into();
        assert!(matches!(err, OrderError::QuotaExceeded { ref rule_id } if rule_id == "promo"));
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_database_errors_are_backend_with_retry_hint() {
        let err: OrderError = PricingError::Database(sqlx::Error::PoolTimedOut).into();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(err.retry_after(), Some(BACKEND_RETRY_AFTER));
    }

    #[test]
    fn test_pricing_errors_keep_their_kind() {
        let err: OrderError = PricingError::RuleNotFound("r".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = OrderError::InvalidTransition("cancelled -> accepted".to_string());
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.retry_after().is_none());
    }
}
