// Error classification for the pricing service
// Maps the domain error enums onto a small, stable set of error kinds

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Coarse error kind shared by every domain error
///
/// Callers branch on the kind rather than on individual variants:
/// - `VersionConflict` means re-read and retry once
/// - `QuotaExceeded` means recompute the quote without the offending rule
/// - `BackendUnavailable` carries a retry-after hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Context out of range, malformed promo code, illegal transition
    Validation,

    /// Rule, order or quote missing
    NotFound,

    /// Optimistic lock miss
    VersionConflict,

    /// Usage cap hit during reservation
    QuotaExceeded,

    /// Persistence or cache unreachable
    BackendUnavailable,

    /// Invariant violation; never committed
    Internal,
}

impl ErrorKind {
    /// Machine-readable error code (e.g. "VERSION_CONFLICT")
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::VersionConflict => "VERSION_CONFLICT",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::VersionConflict | ErrorKind::QuotaExceeded | ErrorKind::BackendUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Implemented by every domain error so it can be reported uniformly
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    /// Retry-after hint for backend failures on write paths
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Uniform error report handed to whatever transport wraps the engine
///
/// Internal and backend details are logged but not copied into the report.
#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub error_code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub timestamp: String,
}

impl ErrorReport {
    /// Build a report, logging at a level that matches the error's severity
    pub fn from_error<E>(err: &E) -> Self
    where
        E: Classify + fmt::Display,
    {
        let kind = err.kind();
        let message = match kind {
            ErrorKind::Internal => {
                error!("Internal error: {}", err);
                "An internal error occurred".to_string()
            }
            ErrorKind::BackendUnavailable => {
                error!("Backend unavailable: {}", err);
                "A backend service is unavailable".to_string()
            }
            ErrorKind::VersionConflict | ErrorKind::QuotaExceeded => {
                warn!("{}: {}", kind.code(), err);
                err.to_string()
            }
            ErrorKind::Validation | ErrorKind::NotFound => {
                debug!("{}: {}", kind.code(), err);
                err.to_string()
            }
        };

        Self {
            error_code: kind.code().to_string(),
            message,
            retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom(ErrorKind);

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom: {}", self.0)
        }
    }

    impl Classify for Boom {
        fn kind(&self) -> ErrorKind {
            self.0
        }

        fn retry_after(&self) -> Option<Duration> {
            (self.0 == ErrorKind::BackendUnavailable).then(|| Duration::from_secs(1))
        }
    }

    #[test]
    fn test_codes() {
        assert_eq!(ErrorKind::VersionConflict.code(), "VERSION_CONFLICT");
        assert_eq!(ErrorKind::QuotaExceeded.to_string(), "QUOTA_EXCEEDED");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::VersionConflict.is_retryable());
        assert!(ErrorKind::BackendUnavailable.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn test_report_hides_internal_details() {
        let report = ErrorReport::from_error(&Boom(ErrorKind::Internal));
        assert_eq!(report.error_code, "INTERNAL_ERROR");
        assert!(!report.message.contains("boom"));
        assert!(report.retry_after_ms.is_none());
    }

    #[test]
    fn test_report_carries_retry_after() {
        let report = ErrorReport::from_error(&Boom(ErrorKind::BackendUnavailable));
        assert_eq!(report.retry_after_ms, Some(1000));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error_code"], "BACKEND_UNAVAILABLE");
    }
}
