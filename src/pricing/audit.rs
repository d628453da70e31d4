// Audit Logger
//
// Records quote, commit and release events to the pricing audit trail.
// Failures are logged and swallowed so an unreachable audit table never blocks
// the pricing path.

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;

use crate::pricing::calculator::FareBreakdown;

/// Kind of event written to the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Quote,
    Attach,
    Commit,
    Release,
    Reprice,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Quote => "quote",
            AuditEvent::Attach => "attach",
            AuditEvent::Commit => "commit",
            AuditEvent::Release => "release",
            AuditEvent::Reprice => "reprice",
        }
    }
}

/// Audit record from the database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRecord {
    pub audit_id: i64,
    pub order_id: Option<String>,
    pub quote_id: Option<String>,
    pub event: AuditEvent,
    pub rule_ids: JsonValue,
    pub payload: JsonValue,
    pub created_at_ms: i64,
}

/// Audit Logger
///
/// Postgres-backed; every `log_*` method returns `()` whatever happens.
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log a computed quote
    pub async fn log_quote(&self, quote_id: &str, breakdown: &FareBreakdown, now_ms: i64) {
        self.record(
            None,
            Some(quote_id),
            AuditEvent::Quote,
            breakdown_payload(breakdown),
            breakdown.rule_ids(),
            now_ms,
        )
        .await;
    }

    /// Log a quote bound onto an order
    pub async fn log_attach(
        &self,
        order_id: &str,
        quote_id: &str,
        breakdown: &FareBreakdown,
        now_ms: i64,
    ) {
        self.record(
            Some(order_id),
            Some(quote_id),
            AuditEvent::Attach,
            breakdown_payload(breakdown),
            breakdown.rule_ids(),
            now_ms,
        )
        .await;
    }

    /// Log confirmed usage on provider acceptance
    pub async fn log_commit(&self, order_id: &str, rule_ids: Vec<String>, now_ms: i64) {
        self.record(Some(order_id), None, AuditEvent::Commit, JsonValue::Null, rule_ids, now_ms)
            .await;
    }

    /// Log released usage, with the cancellation fee charged if any
    pub async fn log_release(
        &self,
        order_id: &str,
        rule_ids: Vec<String>,
        cancellation_fee: Option<rust_decimal::Decimal>,
        now_ms: i64,
    ) {
        let payload = json!({ "cancellation_fee": cancellation_fee });
        self.record(Some(order_id), None, AuditEvent::Release, payload, rule_ids, now_ms)
            .await;
    }

    /// Log the fare recomputed on actual distance and duration
    pub async fn log_reprice(&self, order_id: &str, breakdown: &FareBreakdown, now_ms: i64) {
        self.record(
            Some(order_id),
            None,
            AuditEvent::Reprice,
            breakdown_payload(breakdown),
            breakdown.rule_ids(),
            now_ms,
        )
        .await;
    }

    async fn record(
        &self,
        order_id: Option<&str>,
        quote_id: Option<&str>,
        event: AuditEvent,
        payload: JsonValue,
        rule_ids: Vec<String>,
        now_ms: i64,
    ) {
        if let Err(e) = self
            .insert_audit_record(order_id, quote_id, event, payload, rule_ids, now_ms)
            .await
        {
            tracing::warn!("Failed to write {} audit record: {}", event.as_str(), e);
        }
    }

    async fn insert_audit_record(
        &self,
        order_id: Option<&str>,
        quote_id: Option<&str>,
        event: AuditEvent,
        payload: JsonValue,
        rule_ids: Vec<String>,
        now_ms: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO pricing_audit_log (order_id, quote_id, event, rule_ids, payload, created_at_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(order_id)
        .bind(quote_id)
        .bind(event)
        .bind(JsonValue::from(rule_ids))
        .bind(payload)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Audit records for an order, oldest first
    pub async fn get_audit_records(&self, order_id: &str) -> Result<Vec<AuditRecord>, sqlx::Error> {
        sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT audit_id, order_id, quote_id, event, rule_ids, payload, created_at_ms
            FROM pricing_audit_log
            WHERE order_id = $1
            ORDER BY created_at_ms ASC, audit_id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
    }
}

fn breakdown_payload(breakdown: &FareBreakdown) -> JsonValue {
    serde_json::to_value(breakdown).unwrap_or_else(|e| {
        tracing::warn!("Could not serialize fare breakdown for audit: {}", e);
        JsonValue::Null
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::calculator::{AppliedRule, FareComponents};
    use crate::pricing::types::RuleCategory;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_names() {
        assert_eq!(AuditEvent::Quote.as_str(), "quote");
        assert_eq!(AuditEvent::Release.as_str(), "release");
        assert_eq!(serde_json::to_string(&AuditEvent::Reprice).unwrap(), "\"reprice\"");
    }

    #[test]
    fn test_breakdown_payload_keeps_decimals_exact() {
        let breakdown = FareBreakdown {
            currency: "USD".to_string(),
            components: FareComponents::default(),
            original_amount: dec!(23.00),
            surged_amount: dec!(34.50),
            total_discount: dec!(6.90),
            platform_fee: dec!(2.00),
            discounted_amount: dec!(27.60),
            payment_amount: dec!(29.60),
            applied_rules: vec![AppliedRule {
                rule_id: "disc".to_string(),
                category: RuleCategory::Discount,
                amount: dec!(6.90),
            }],
            warnings: vec![],
        };

        let payload = breakdown_payload(&breakdown);
        assert_eq!(payload["payment_amount"], "29.60");
        assert_eq!(payload["applied_rules"][0]["rule_id"], "disc");
    }
}
