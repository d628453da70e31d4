// Promo Code Resolver
// Maps user-supplied codes onto at most one rule each

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::pricing::catalog::RuleSnapshot;
use crate::pricing::error::{PricingError, PricingResult};

fn code_pattern() -> PricingResult<&'static Regex> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,32}$"))
        .as_ref()
        .map_err(|err| PricingError::Internal(format!("promo code pattern: {}", err)))
}

/// A supplied code and the rule it resolved to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMatch {
    pub code: String,
    pub rule_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromoResolution {
    pub matched: Vec<CodeMatch>,
    pub unmatched: Vec<String>,
}

impl PromoResolution {
    /// rule id → code, for the eligibility filter
    pub fn by_rule(&self) -> HashMap<String, String> {
        self.matched
            .iter()
            .map(|m| (m.rule_id.clone(), m.code.clone()))
            .collect()
    }
}

/// Trim and syntax-check a supplied code
pub fn normalize(code: &str) -> PricingResult<&str> {
    let trimmed = code.trim();
    if code_pattern()?.is_match(trimmed) {
        Ok(trimmed)
    } else {
        Err(PricingError::Validation(format!("Malformed promo code: {:?}", code)))
    }
}

/// Resolve each code against the snapshot
///
/// Case-sensitive rules are searched by exact match first, then
/// case-insensitive rules by folded match. Only rules active at `now_ms` can
/// claim a code. A code given twice, or two codes resolving to the same rule,
/// yields a single match.
pub fn resolve(
    snapshot: &RuleSnapshot,
    codes: &[String],
    now_ms: i64,
) -> PricingResult<PromoResolution> {
    let mut resolution = PromoResolution::default();

    for raw in codes {
        let code = normalize(raw)?;

        let found = snapshot
            .find_code(code, true, now_ms)
            .or_else(|| snapshot.find_code(code, false, now_ms));

        match found {
            Some(rule) => {
                if resolution.matched.iter().any(|m| m.rule_id == rule.rule_id) {
                    continue;
                }
                tracing::debug!("Promo code {} resolved to rule {}", code, rule.rule_id);
                resolution.matched.push(CodeMatch {
                    code: code.to_string(),
                    rule_id: rule.rule_id.clone(),
                });
            }
            None => {
                tracing::debug!("Promo code {} matched no active rule", code);
                if !resolution.unmatched.iter().any(|c| c == code) {
                    resolution.unmatched.push(code.to_string());
                }
            }
        }
    }

    Ok(resolution)
}
