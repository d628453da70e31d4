use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::Postgres;
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, QueryBuilder};
use std::time::Duration;

use crate::db;
use crate::orders::error::{OrderError, OrderResult};
use crate::orders::{
    DispatchInfo, Location, Order, OrderStatus, PaymentStatus, RideFare, RideOrderDetail,
    ScheduleType,
};
use crate::pricing::calculator::FareBreakdown;
use crate::pricing::context::PricingContext;
use crate::pricing::usage::{self, UsageClaim};

/// Usage counter change applied in the same transaction as an order update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageChange {
    None,
    /// Release whatever the order holds, then reserve these claims
    Rebind(Vec<UsageClaim>),
    /// Reserve any claim not already held, then confirm every reservation
    Commit(Vec<UsageClaim>),
    /// Give back everything the order holds
    Release,
}

/// Persistence seam for orders
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order (and its ride detail); an existing id is a validation error
    async fn insert_order(&self, order: &Order, ride: Option<&RideOrderDetail>) -> OrderResult<()>;

    async fn get_order(&self, order_id: &str) -> OrderResult<Option<Order>>;

    async fn get_ride(&self, order_id: &str) -> OrderResult<Option<RideOrderDetail>>;

    /// Write `order` over the row at `order.version`
    ///
    /// Succeeds only while the stored version still equals `order.version`;
    /// the stored and returned order carry `version + 1`. `usage` runs inside
    /// the same transaction with `order.updated_at` as its timestamp.
    async fn update_versioned(
        &self,
        order: &Order,
        ride: Option<&RideOrderDetail>,
        usage: UsageChange,
    ) -> OrderResult<Order>;
}

/// Order columns after `order_id`, in bind order
const ORDER_COLUMNS: &str = "version, order_type, user_id, provider_id, status, payment_status, currency, \
    original_amount, discounted_amount, payment_amount, total_discount_amount, platform_fee, \
    cancellation_fee, promo_discount, fare, quote_id, pricing_context, promo_codes, \
    user_promotion_ids, schedule_type, scheduled_at, expires_at, accepted_at, started_at, \
    ended_at, completed_at, cancelled_at, expired_at, cancelled_by, cancel_reason, \
    dispatch_status, dispatch_round, dispatch_max_rounds, dispatch_started_at, \
    dispatch_updated_at, dispatch_strategy, metadata, created_at, updated_at";

/// Ride detail columns after `order_id`, in bind order
const RIDE_COLUMNS: &str = "vehicle_id, vehicle_category, vehicle_level, passenger_count, \
    pickup_address, pickup_lat, pickup_lng, pickup_landmark, \
    dropoff_address, dropoff_lat, dropoff_lng, dropoff_landmark, \
    estimated_distance_km, estimated_duration_min, actual_distance_km, actual_duration_min, \
    fare_base, fare_distance, fare_time, fare_surge, fare_total, \
    driver_en_route_at, driver_arrived_at, route";

/// Raw `orders` row
#[derive(Debug, sqlx::FromRow)]
pub struct OrderRow {
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
    pub fare: Option<Json<FareBreakdown>>,
    pub quote_id: Option<String>,
    pub pricing_context: Option<Json<PricingContext>>,
    pub promo_codes: Option<Json<Vec<String>>>,
    pub user_promotion_ids: Option<Json<Vec<String>>>,
    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub accepted_at: Option<i64>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub expired_at: Option<i64>,
    pub cancelled_by: Option<String>,
    pub cancel_reason: Option<String>,
    pub dispatch_status: Option<String>,
    pub dispatch_round: i32,
    pub dispatch_max_rounds: i32,
    pub dispatch_started_at: Option<i64>,
    pub dispatch_updated_at: Option<i64>,
    pub dispatch_strategy: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Order {
            order_id: row.order_id,
            version: row.version,
            order_type: row.order_type,
            user_id: row.user_id,
            provider_id: row.provider_id,
            status: row.status,
            payment_status: row.payment_status,
            currency: row.currency,
            original_amount: row.original_amount,
            discounted_amount: row.discounted_amount,
            payment_amount: row.payment_amount,
            total_discount_amount: row.total_discount_amount,
            platform_fee: row.platform_fee,
            cancellation_fee: row.cancellation_fee,
            promo_discount: row.promo_discount,
            fare: row.fare.map(|Json(fare)| fare),
            quote_id: row.quote_id,
            pricing_context: row.pricing_context.map(|Json(ctx)| ctx),
            promo_codes: row.promo_codes.map(|Json(codes)| codes).unwrap_or_default(),
            user_promotion_ids: row
                .user_promotion_ids
                .map(|Json(ids)| ids)
                .unwrap_or_default(),
            schedule_type: row.schedule_type,
            scheduled_at: row.scheduled_at,
            expires_at: row.expires_at,
            accepted_at: row.accepted_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            expired_at: row.expired_at,
            cancelled_by: row.cancelled_by,
            cancel_reason: row.cancel_reason,
            dispatch: DispatchInfo {
                status: row.dispatch_status,
                current_round: row.dispatch_round,
                max_rounds: row.dispatch_max_rounds,
                started_at: row.dispatch_started_at,
                updated_at: row.dispatch_updated_at,
                strategy: row.dispatch_strategy.unwrap_or(JsonValue::Null),
            },
            metadata: row.metadata.unwrap_or(JsonValue::Null),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Raw `ride_orders` row
#[derive(Debug, sqlx::FromRow)]
pub struct RideOrderRow {
    pub order_id: String,
    pub vehicle_id: Option<String>,
    pub vehicle_category: Option<String>,
    pub vehicle_level: Option<String>,
    pub passenger_count: i32,
    pub pickup_address: String,
    pub pickup_lat: Decimal,
    pub pickup_lng: Decimal,
    pub pickup_landmark: Option<String>,
    pub dropoff_address: String,
    pub dropoff_lat: Decimal,
    pub dropoff_lng: Decimal,
    pub dropoff_landmark: Option<String>,
    pub estimated_distance_km: Decimal,
    pub estimated_duration_min: Decimal,
    pub actual_distance_km: Option<Decimal>,
    pub actual_duration_min: Option<Decimal>,
    pub fare_base: Decimal,
    pub fare_distance: Decimal,
    pub fare_time: Decimal,
    pub fare_surge: Decimal,
    pub fare_total: Decimal,
    pub driver_en_route_at: Option<i64>,
    pub driver_arrived_at: Option<i64>,
    pub route: Option<JsonValue>,
}

impl From<RideOrderRow> for RideOrderDetail {
    fn from(row: RideOrderRow) -> Self {
        RideOrderDetail {
            order_id: row.order_id,
            vehicle_id: row.vehicle_id,
            vehicle_category: row.vehicle_category,
            vehicle_level: row.vehicle_level,
            passenger_count: row.passenger_count,
            pickup: Location {
                address: row.pickup_address,
                lat: row.pickup_lat,
                lng: row.pickup_lng,
                landmark: row.pickup_landmark,
            },
            dropoff: Location {
                address: row.dropoff_address,
                lat: row.dropoff_lat,
                lng: row.dropoff_lng,
                landmark: row.dropoff_landmark,
            },
            estimated_distance_km: row.estimated_distance_km,
            estimated_duration_min: row.estimated_duration_min,
            actual_distance_km: row.actual_distance_km,
            actual_duration_min: row.actual_duration_min,
            fare: RideFare {
                base: row.fare_base,
                distance: row.fare_distance,
                time: row.fare_time,
                surge: row.fare_surge,
                total: row.fare_total,
            },
            driver_en_route_at: row.driver_en_route_at,
            driver_arrived_at: row.driver_arrived_at,
            route: row.route.unwrap_or(JsonValue::Null),
        }
    }
}

fn push_order(values: &mut Separated<'_, '_, Postgres, &'static str>, order: &Order) {
    let dispatch = &order.dispatch;
    values
        .push_bind(order.version)
        .push_bind(order.order_type.clone())
        .push_bind(order.user_id.clone())
        .push_bind(order.provider_id.clone())
        .push_bind(order.status)
        .push_bind(order.payment_status)
        .push_bind(order.currency.clone())
        .push_bind(order.original_amount)
        .push_bind(order.discounted_amount)
        .push_bind(order.payment_amount)
        .push_bind(order.total_discount_amount)
        .push_bind(order.platform_fee)
        .push_bind(order.cancellation_fee)
        .push_bind(order.promo_discount)
        .push_bind(order.fare.clone().map(Json))
        .push_bind(order.quote_id.clone())
        .push_bind(order.pricing_context.clone().map(Json))
        .push_bind(Json(order.promo_codes.clone()))
        .push_bind(Json(order.user_promotion_ids.clone()))
        .push_bind(order.schedule_type)
        .push_bind(order.scheduled_at)
        .push_bind(order.expires_at)
        .push_bind(order.accepted_at)
        .push_bind(order.started_at)
        .push_bind(order.ended_at)
        .push_bind(order.completed_at)
        .push_bind(order.cancelled_at)
        .push_bind(order.expired_at)
        .push_bind(order.cancelled_by.clone())
        .push_bind(order.cancel_reason.clone())
        .push_bind(dispatch.status.clone())
        .push_bind(dispatch.current_round)
        .push_bind(dispatch.max_rounds)
        .push_bind(dispatch.started_at)
        .push_bind(dispatch.updated_at)
        .push_bind(dispatch.strategy.clone())
        .push_bind(order.metadata.clone())
        .push_bind(order.created_at)
        .push_bind(order.updated_at);
}

fn push_ride(values: &mut Separated<'_, '_, Postgres, &'static str>, ride: &RideOrderDetail) {
    values
        .push_bind(ride.vehicle_id.clone())
        .push_bind(ride.vehicle_category.clone())
        .push_bind(ride.vehicle_level.clone())
        .push_bind(ride.passenger_count)
        .push_bind(ride.pickup.address.clone())
        .push_bind(ride.pickup.lat)
        .push_bind(ride.pickup.lng)
        .push_bind(ride.pickup.landmark.clone())
        .push_bind(ride.dropoff.address.clone())
        .push_bind(ride.dropoff.lat)
        .push_bind(ride.dropoff.lng)
        .push_bind(ride.dropoff.landmark.clone())
        .push_bind(ride.estimated_distance_km)
        .push_bind(ride.estimated_duration_min)
        .push_bind(ride.actual_distance_km)
        .push_bind(ride.actual_duration_min)
        .push_bind(ride.fare.base)
        .push_bind(ride.fare.distance)
        .push_bind(ride.fare.time)
        .push_bind(ride.fare.surge)
        .push_bind(ride.fare.total)
        .push_bind(ride.driver_en_route_at)
        .push_bind(ride.driver_arrived_at)
        .push_bind(ride.route.clone());
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map_or(false, |code| code == "23505"),
        _ => false,
    }
}

/// Run a usage change on an open transaction
pub async fn apply_usage_in(
    conn: &mut PgConnection,
    order: &Order,
    change: &UsageChange,
) -> OrderResult<()> {
    let now_ms = order.updated_at;
    match change {
        UsageChange::None => {}
        UsageChange::Rebind(claims) => {
            usage::release_in(&mut *conn, &order.order_id, now_ms).await?;
            usage::reserve_in(&mut *conn, claims, &order.user_id, &order.order_id, now_ms).await?;
        }
        UsageChange::Commit(claims) => {
            usage::reserve_in(&mut *conn, claims, &order.user_id, &order.order_id, now_ms).await?;
            usage::confirm_in(&mut *conn, &order.order_id, now_ms).await?;
        }
        UsageChange::Release => {
            usage::release_in(&mut *conn, &order.order_id, now_ms).await?;
        }
    }
    Ok(())
}

/// Repository for ride orders
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
    deadline: Duration,
}

impl PgOrderStore {
    pub fn new(pool: PgPool, deadline: Duration) -> Self {
        Self { pool, deadline }
    }

    async fn insert_in_tx(
        &self,
        order: &Order,
        ride: Option<&RideOrderDetail>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("INSERT INTO orders (order_id, ");
        builder.push(ORDER_COLUMNS);
        builder.push(") VALUES (");
        {
            let mut values = builder.separated(", ");
            values.push_bind(order.order_id.clone());
            push_order(&mut values, order);
        }
        builder.push(")");
        builder.build().execute(&mut *tx).await?;

        if let Some(ride) = ride {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO ride_orders (order_id, ");
            builder.push(RIDE_COLUMNS);
            builder.push(") VALUES (");
            {
                let mut values = builder.separated(", ");
                values.push_bind(order.order_id.clone());
                push_ride(&mut values, ride);
            }
            builder.push(")");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_in_tx(
        &self,
        order: &Order,
        ride: Option<&RideOrderDetail>,
        change: &UsageChange,
    ) -> OrderResult<Order> {
        let mut next = order.clone();
        next.version = order.version + 1;

        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE orders SET (");
        builder.push(ORDER_COLUMNS);
        builder.push(") = (");
        {
            let mut values = builder.separated(", ");
            push_order(&mut values, &next);
        }
        builder.push(") WHERE order_id = ");
        builder.push_bind(order.order_id.clone());
        builder.push(" AND version = ");
        builder.push_bind(order.version);
        let result = builder.build().execute(&mut *tx).await?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls it back
            drop(tx);
            return match self.get_order(&order.order_id).await? {
                Some(_) => Err(OrderError::VersionConflict(order.order_id.clone())),
                None => Err(OrderError::NotFound(order.order_id.clone())),
            };
        }

        if let Some(ride) = ride {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE ride_orders SET (");
            builder.push(RIDE_COLUMNS);
            builder.push(") = (");
            {
                let mut values = builder.separated(", ");
                push_ride(&mut values, ride);
            }
            builder.push(") WHERE order_id = ");
            builder.push_bind(order.order_id.clone());
            builder.build().execute(&mut *tx).await?;
        }

        apply_usage_in(&mut *tx, &next, change).await?;

        tx.commit().await?;
        Ok(next)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert_order(&self, order: &Order, ride: Option<&RideOrderDetail>) -> OrderResult<()> {
        let inserted = tokio::time::timeout(self.deadline, self.insert_in_tx(order, ride))
            .await
            .map_err(|_| OrderError::backend("order insert timed out"))?;

        match inserted {
            Ok(()) => {
                tracing::info!("Inserted order {}", order.order_id);
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => Err(OrderError::Validation(format!(
                "Order {} already exists",
                order.order_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_order(&self, order_id: &str) -> OrderResult<Option<Order>> {
        let sql = format!(
            "SELECT order_id, {} FROM orders WHERE order_id = $1",
            ORDER_COLUMNS
        );
        let row = db::bounded(self.deadline, || {
            sqlx::query_as::<_, OrderRow>(&sql)
                .bind(order_id)
                .fetch_optional(&self.pool)
        })
        .await?;

        Ok(row.map(Order::from))
    }

    async fn get_ride(&self, order_id: &str) -> OrderResult<Option<RideOrderDetail>> {
        let sql = format!(
            "SELECT order_id, {} FROM ride_orders WHERE order_id = $1",
            RIDE_COLUMNS
        );
        let row = db::bounded(self.deadline, || {
            sqlx::query_as::<_, RideOrderRow>(&sql)
                .bind(order_id)
                .fetch_optional(&self.pool)
        })
        .await?;

        Ok(row.map(RideOrderDetail::from))
    }

    async fn update_versioned(
        &self,
        order: &Order,
        ride: Option<&RideOrderDetail>,
        usage: UsageChange,
    ) -> OrderResult<Order> {
        let updated = tokio::time::timeout(self.deadline, self.update_in_tx(order, ride, &usage))
            .await
            .map_err(|_| OrderError::backend("order update timed out"))??;

        tracing::debug!(
            "Order {} updated to version {} ({})",
            updated.order_id,
            updated.version,
            updated.status
        );
        Ok(updated)
    }
}
