// Usage Accountant
//
// Reserve → confirm / release protocol over rule usage counters. A
// reservation increments every counter of every claimed rule or none of them;
// releases are idempotent per (rule_id, order_id). The Postgres functions here
// take a bare connection so the order repository can run them inside its own
// versioned-update transaction.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::db;
use crate::pricing::calculator::FareBreakdown;
use crate::pricing::error::{PricingError, PricingResult};
use crate::pricing::metrics::PerformanceMetrics;

/// Default age after which an unconfirmed reservation is swept
pub const DEFAULT_RESERVATION_GRACE: Duration = Duration::from_secs(15 * 60);

/// One rule's usage claimed by an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageClaim {
    pub rule_id: String,
    /// Calendar day the daily counter is charged to
    pub day: NaiveDate,
}

/// Claims for every rule applied in `breakdown`, sorted by rule id
///
/// Sorting gives every transaction the same lock order on counter rows.
pub fn claims_for(breakdown: &FareBreakdown, day: NaiveDate) -> Vec<UsageClaim> {
    let mut claims: Vec<UsageClaim> = breakdown
        .applied_rules
        .iter()
        .map(|applied| UsageClaim {
            rule_id: applied.rule_id.clone(),
            day,
        })
        .collect();
    claims.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
    claims.dedup_by(|a, b| a.rule_id == b.rule_id);
    claims
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
    Released,
}

impl ReservationStatus {
    /// Reserved and confirmed reservations hold counter increments
    pub fn holds_usage(&self) -> bool {
        !matches!(self, ReservationStatus::Released)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
        })
    }
}

/// A `rule_reservations` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageReservation {
    pub rule_id: String,
    pub order_id: String,
    pub user_id: String,
    pub day: NaiveDate,
    pub status: ReservationStatus,
    pub reserved_at_ms: i64,
}

/// Persistence seam for usage counters
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Increment every claimed counter, or fail with `QuotaExceeded` and change nothing
    async fn reserve(
        &self,
        claims: &[UsageClaim],
        user_id: &str,
        order_id: &str,
        now_ms: i64,
    ) -> PricingResult<()>;

    /// Mark the order's reservations confirmed; returns rows changed
    async fn confirm(&self, order_id: &str, now_ms: i64) -> PricingResult<u64>;

    /// Give back every counter the order holds; returns rows changed
    async fn release(&self, order_id: &str, now_ms: i64) -> PricingResult<u64>;

    /// Uses of `rule_id` currently held by `user_id`
    async fn user_usage(&self, rule_id: &str, user_id: &str) -> PricingResult<i64>;

    /// Orders with reservations still unconfirmed before `cutoff_ms`
    async fn stale_orders(&self, cutoff_ms: i64) -> PricingResult<Vec<String>>;

    async fn reservations(&self, order_id: &str) -> PricingResult<Vec<UsageReservation>>;
}

/// Usage Accountant
///
/// Front for a `UsageStore` that records metrics and runs the sweeper.
pub struct UsageAccountant {
    store: Arc<dyn UsageStore>,
    grace: Duration,
    metrics: PerformanceMetrics,
}

impl UsageAccountant {
    pub fn new(store: Arc<dyn UsageStore>, grace: Duration, metrics: PerformanceMetrics) -> Self {
        Self {
            store,
            grace,
            metrics,
        }
    }

    pub async fn reserve(
        &self,
        claims: &[UsageClaim],
        user_id: &str,
        order_id: &str,
        now_ms: i64,
    ) -> PricingResult<()> {
        if claims.is_empty() {
            return Ok(());
        }
        match self.store.reserve(claims, user_id, order_id, now_ms).await {
            Ok(()) => {
                self.metrics.record_reservation();
                tracing::debug!("Reserved {} rule uses for order {}", claims.len(), order_id);
                Ok(())
            }
            Err(err) => {
                if let PricingError::QuotaExceeded { rule_id } = &err {
                    self.metrics.record_quota_rejection();
                    tracing::warn!("Reservation for order {} hit quota on rule {}", order_id, rule_id);
                }
                Err(err)
            }
        }
    }

    pub async fn confirm(&self, order_id: &str, now_ms: i64) -> PricingResult<u64> {
        self.store.confirm(order_id, now_ms).await
    }

    pub async fn release(&self, order_id: &str, now_ms: i64) -> PricingResult<u64> {
        let released = self.store.release(order_id, now_ms).await?;
        if released > 0 {
            self.metrics.record_release(released);
            tracing::info!("Released {} rule uses held by order {}", released, order_id);
        }
        Ok(released)
    }

    pub async fn user_usage(&self, rule_id: &str, user_id: &str) -> PricingResult<i64> {
        self.store.user_usage(rule_id, user_id).await
    }

    pub async fn reservations(&self, order_id: &str) -> PricingResult<Vec<UsageReservation>> {
        self.store.reservations(order_id).await
    }

    /// Release reservations left unconfirmed past the grace period
    pub async fn sweep(&self, now_ms: i64) -> PricingResult<u64> {
        let cutoff = now_ms - self.grace.as_millis() as i64;
        let orders = self.store.stale_orders(cutoff).await?;

        let mut released = 0;
        for order_id in orders {
            match self.store.release(&order_id, now_ms).await {
                Ok(count) => released += count,
                // Keep sweeping the rest; the order is picked up again next tick
                Err(err) => tracing::warn!("Sweeper could not release order {}: {}", order_id, err),
            }
        }

        if released > 0 {
            self.metrics.record_release(released);
            tracing::info!("Sweeper released {} abandoned reservations", released);
        }
        Ok(released)
    }

    /// Spawn the reservation sweeper
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        if let Err(err) = self.sweep(now_ms).await {
                            tracing::warn!("Reservation sweep failed: {}", err);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Reservation sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Reserve inside an open transaction
pub async fn reserve_in(
    conn: &mut PgConnection,
    claims: &[UsageClaim],
    user_id: &str,
    order_id: &str,
    now_ms: i64,
) -> PricingResult<()> {
    for claim in claims {
        let existing: Option<ReservationStatus> = sqlx::query_scalar(
            r#"
            SELECT status FROM rule_reservations
            WHERE rule_id = $1 AND order_id = $2
            FOR UPDATE
            "#,
        )
        .bind(&claim.rule_id)
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await?;

        if existing.map_or(false, |status| status.holds_usage()) {
            continue;
        }

        // Daily counter resets lazily when usage_day moves forward; a claim
        // for an earlier day leaves the current day's counter alone
        let per_user_cap: Option<Option<i64>> = sqlx::query_scalar(
            r#"
            UPDATE price_rules
            SET usage_count = usage_count + 1,
                usage_today = CASE
                    WHEN usage_day = $2 THEN usage_today + 1
                    WHEN usage_day > $2 THEN usage_today
                    ELSE 1
                END,
                usage_day = GREATEST(COALESCE(usage_day, $2), $2)
            WHERE rule_id = $1
              AND (max_usage_total IS NULL OR usage_count < max_usage_total)
              AND (max_usage_per_day IS NULL
                   OR (CASE WHEN usage_day = $2 THEN usage_today ELSE 0 END) < max_usage_per_day)
            RETURNING max_usage_per_user
            "#,
        )
        .bind(&claim.rule_id)
        .bind(claim.day)
        .fetch_optional(&mut *conn)
        .await?;

        let per_user_cap = match per_user_cap {
            Some(cap) => cap,
            None => {
                let exists: Option<i32> =
                    sqlx::query_scalar("SELECT 1 FROM price_rules WHERE rule_id = $1")
                        .bind(&claim.rule_id)
                        .fetch_optional(&mut *conn)
                        .await?;
                return Err(match exists {
                    Some(_) => PricingError::QuotaExceeded {
                        rule_id: claim.rule_id.clone(),
                    },
                    None => PricingError::RuleNotFound(claim.rule_id.clone()),
                });
            }
        };

        if let Some(cap) = per_user_cap {
            let held: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(usage_count), 0)::BIGINT
                FROM rule_usage
                WHERE rule_id = $1 AND user_id = $2
                "#,
            )
            .bind(&claim.rule_id)
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await?;
            if held >= cap {
                return Err(PricingError::QuotaExceeded {
                    rule_id: claim.rule_id.clone(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO rule_usage (rule_id, user_id, day, usage_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (rule_id, user_id, day)
            DO UPDATE SET usage_count = rule_usage.usage_count + 1
            "#,
        )
        .bind(&claim.rule_id)
        .bind(user_id)
        .bind(claim.day)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO rule_reservations (rule_id, order_id, user_id, day, status, reserved_at_ms)
            VALUES ($1, $2, $3, $4, 'reserved', $5)
            ON CONFLICT (rule_id, order_id)
            DO UPDATE SET user_id = EXCLUDED.user_id,
                          day = EXCLUDED.day,
                          status = 'reserved',
                          reserved_at_ms = EXCLUDED.reserved_at_ms
            "#,
        )
        .bind(&claim.rule_id)
        .bind(order_id)
        .bind(user_id)
        .bind(claim.day)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Confirm inside an open transaction
pub async fn confirm_in(conn: &mut PgConnection, order_id: &str, now_ms: i64) -> PricingResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE rule_reservations
        SET status = 'confirmed', confirmed_at_ms = $2
        WHERE order_id = $1 AND status = 'reserved'
        "#,
    )
    .bind(order_id)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Release inside an open transaction
pub async fn release_in(conn: &mut PgConnection, order_id: &str, now_ms: i64) -> PricingResult<u64> {
    let released: Vec<(String, String, NaiveDate)> = sqlx::query_as(
        r#"
        UPDATE rule_reservations
        SET status = 'released', released_at_ms = $2
        WHERE order_id = $1 AND status IN ('reserved', 'confirmed')
        RETURNING rule_id, user_id, day
        "#,
    )
    .bind(order_id)
    .bind(now_ms)
    .fetch_all(&mut *conn)
    .await?;

    for (rule_id, user_id, day) in &released {
        sqlx::query(
            r#"
            UPDATE price_rules
            SET usage_count = GREATEST(usage_count - 1, 0),
                usage_today = CASE WHEN usage_day = $2
                                   THEN GREATEST(usage_today - 1, 0)
                                   ELSE usage_today END
            WHERE rule_id = $1
            "#,
        )
        .bind(rule_id)
        .bind(day)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            UPDATE rule_usage
            SET usage_count = GREATEST(usage_count - 1, 0)
            WHERE rule_id = $1 AND user_id = $2 AND day = $3
            "#,
        )
        .bind(rule_id)
        .bind(user_id)
        .bind(day)
        .execute(&mut *conn)
        .await?;
    }

    Ok(released.len() as u64)
}

/// Postgres-backed usage store
pub struct PgUsageStore {
    pool: PgPool,
    deadline: Duration,
}

impl PgUsageStore {
    pub fn new(pool: PgPool, deadline: Duration) -> Self {
        Self { pool, deadline }
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn reserve(
        &self,
        claims: &[UsageClaim],
        user_id: &str,
        order_id: &str,
        now_ms: i64,
    ) -> PricingResult<()> {
        let mut tx = self.pool.begin().await?;
        let reserved = tokio::time::timeout(
            self.deadline,
            reserve_in(&mut *tx, claims, user_id, order_id, now_ms),
        )
        .await
        .map_err(|_| PricingError::Database(sqlx::Error::PoolTimedOut))?;
        reserved?;
        tx.commit().await?;
        Ok(())
    }

    async fn confirm(&self, order_id: &str, now_ms: i64) -> PricingResult<u64> {
        let mut tx = self.pool.begin().await?;
        let confirmed = confirm_in(&mut *tx, order_id, now_ms).await?;
        tx.commit().await?;
        Ok(confirmed)
    }

    async fn release(&self, order_id: &str, now_ms: i64) -> PricingResult<u64> {
        let mut tx = self.pool.begin().await?;
        let released = tokio::time::timeout(self.deadline, release_in(&mut *tx, order_id, now_ms))
            .await
            .map_err(|_| PricingError::Database(sqlx::Error::PoolTimedOut))??;
        tx.commit().await?;
        Ok(released)
    }

    async fn user_usage(&self, rule_id: &str, user_id: &str) -> PricingResult<i64> {
        let held = db::bounded(self.deadline, || {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COALESCE(SUM(usage_count), 0)::BIGINT
                FROM rule_usage
                WHERE rule_id = $1 AND user_id = $2
                "#,
            )
            .bind(rule_id)
            .bind(user_id)
            .fetch_one(&self.pool)
        })
        .await?;
        Ok(held)
    }

    async fn stale_orders(&self, cutoff_ms: i64) -> PricingResult<Vec<String>> {
        let orders = db::bounded(self.deadline, || {
            sqlx::query_scalar::<_, String>(
                r#"
                SELECT DISTINCT order_id
                FROM rule_reservations
                WHERE status = 'reserved' AND reserved_at_ms < $1
                ORDER BY order_id
                "#,
            )
            .bind(cutoff_ms)
            .fetch_all(&self.pool)
        })
        .await?;
        Ok(orders)
    }

    async fn reservations(&self, order_id: &str) -> PricingResult<Vec<UsageReservation>> {
        let rows = db::bounded(self.deadline, || {
            sqlx::query_as::<_, UsageReservation>(
                r#"
                SELECT rule_id, order_id, user_id, day, status, reserved_at_ms
                FROM rule_reservations
                WHERE order_id = $1
                ORDER BY rule_id
                "#,
            )
            .bind(order_id)
            .fetch_all(&self.pool)
        })
        .await?;
        Ok(rows)
    }
}
