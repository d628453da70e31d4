// Order Fare Binder
//
// Binds quotes to ride orders and drives the fare through the order
// lifecycle. Every write goes through `OrderStore::update_versioned`, so usage
// counters move in the same transaction as the order row and a stale version
// never overwrites a newer one.

use rust_decimal::Decimal;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use validator::Validate;

use crate::cache::{self, Cache, CacheKeys};
use crate::orders::error::{OrderError, OrderResult};
use crate::orders::quote_book::QuoteBook;
use crate::orders::repository::{OrderStore, UsageChange};
use crate::orders::status_machine::StatusMachine;
use crate::orders::{
    NewRideOrder, Order, OrderPatch, OrderStatus, PaymentStatus, RideFare, RideOrderDetail,
    ScheduleType,
};
use crate::pricing::calculator::FareBreakdown;
use crate::pricing::context::PricingContext;
use crate::pricing::metrics::PerformanceMetrics;
use crate::pricing::usage::{self, UsageClaim};
use crate::pricing::{PricingEngine, Quote};

/// Order Fare Binder
pub struct OrderFareBinder {
    engine: Arc<PricingEngine>,
    orders: Arc<dyn OrderStore>,
    quotes: QuoteBook,
    cache: Arc<dyn Cache>,
    keys: CacheKeys,
    metrics: PerformanceMetrics,
}

impl OrderFareBinder {
    pub fn new(
        engine: Arc<PricingEngine>,
        orders: Arc<dyn OrderStore>,
        cache: Arc<dyn Cache>,
        keys: CacheKeys,
    ) -> Self {
        let metrics = engine.metrics().clone();
        Self {
            engine,
            orders,
            quotes: QuoteBook::new(),
            cache,
            keys,
            metrics,
        }
    }

    pub fn quotes(&self) -> &QuoteBook {
        &self.quotes
    }

    /// Create a ride order in `requested` status with no fare bound
    pub async fn create_order(&self, request: NewRideOrder, now_ms: i64) -> OrderResult<Order> {
        request.validate()?;

        let mut order = Order::requested(
            request.order_id.clone(),
            request.user_id.clone(),
            request.currency.clone(),
            now_ms,
        );
        if request.scheduled_at.is_some() {
            order.schedule_type = ScheduleType::Scheduled;
        }
        order.scheduled_at = request.scheduled_at;
        order.expires_at = request.expires_at;
        order.metadata = request.metadata;

        let ride = RideOrderDetail {
            order_id: request.order_id,
            vehicle_id: None,
            vehicle_category: request.vehicle_category,
            vehicle_level: request.vehicle_level,
            passenger_count: request.passenger_count,
            pickup: request.pickup,
            dropoff: request.dropoff,
            estimated_distance_km: request.estimated_distance_km,
            estimated_duration_min: request.estimated_duration_min,
            actual_distance_km: None,
            actual_duration_min: None,
            fare: RideFare::default(),
            driver_en_route_at: None,
            driver_arrived_at: None,
            route: JsonValue::Null,
        };

        self.orders.insert_order(&order, Some(&ride)).await?;
        tracing::info!("Created ride order {} for user {}", order.order_id, order.user_id);
        Ok(order)
    }

    /// Compute a quote and keep it available for attachment
    pub async fn quote(&self, ctx: PricingContext, codes: &[String]) -> OrderResult<Quote> {
        let quote = self.engine.quote(ctx, codes).await?;
        self.quotes.insert(quote.clone()).await;
        Ok(quote)
    }

    /// Bind a quote to a requested order and reserve its rule usage
    ///
    /// A reservation refused by a usage cap recomputes the quote once with the
    /// exhausted rule excluded and binds that instead.
    pub async fn attach_quote(
        &self,
        order_id: &str,
        quote_id: &str,
        now_ms: i64,
    ) -> OrderResult<Order> {
        let quote = self.quotes.get(quote_id, now_ms).await?;
        let order = self.load(order_id).await?;

        if order.user_id != quote.context.user_id {
            return Err(OrderError::Validation(format!(
                "Quote {} was issued to another user",
                quote_id
            )));
        }
        if order.status != OrderStatus::Requested {
            return Err(OrderError::InvalidTransition(format!(
                "cannot attach a quote to a {} order",
                order.status
            )));
        }

        match self.bind(&order, &quote, now_ms).await {
            Err(OrderError::QuotaExceeded { rule_id }) => {
                tracing::warn!(
                    "Rule {} exhausted while binding order {}, recomputing without it",
                    rule_id,
                    order_id
                );
                let mut ctx = quote.context.clone();
                ctx.excluded_rule_ids.push(rule_id);
                let retry = self.engine.quote(ctx, &quote.codes).await?;

                self.quotes.remove(quote_id).await;
                self.quotes.insert(retry.clone()).await;
                self.bind(&order, &retry, now_ms).await
            }
            other => other,
        }
    }

    async fn bind(&self, order: &Order, quote: &Quote, now_ms: i64) -> OrderResult<Order> {
        let mut next = order.clone();
        next.bind_fare(&quote.breakdown, &quote.promo_rule_ids());
        next.quote_id = Some(quote.quote_id.clone());
        next.pricing_context = Some(quote.context.clone());
        next.promo_codes = quote.applied_codes();
        next.updated_at = now_ms;

        let ride = self.orders.get_ride(&order.order_id).await?.map(|mut ride| {
            ride.fare = RideFare::from_breakdown(&quote.breakdown);
            ride.estimated_distance_km = quote.context.distance_km;
            ride.estimated_duration_min = quote.context.duration_min;
            ride
        });

        let claims = usage::claims_for(&quote.breakdown, quote.context.today());
        let claimed = !claims.is_empty();
        let updated = self
            .write(&next, ride.as_ref(), UsageChange::Rebind(claims))
            .await?;

        if claimed {
            self.metrics.record_reservation();
        }
        if let Some(audit) = self.engine.audit() {
            audit
                .log_attach(&updated.order_id, &quote.quote_id, &quote.breakdown, now_ms)
                .await;
        }
        tracing::info!(
            "Order {} bound to quote {} ({} {})",
            updated.order_id,
            quote.quote_id,
            updated.payment_amount,
            updated.currency
        );
        Ok(updated)
    }

    /// Provider accepted the order: confirm the usage the fare holds
    ///
    /// Accepting an already accepted order is a no-op.
    pub async fn commit_on_accept(
        &self,
        order_id: &str,
        provider_id: &str,
        now_ms: i64,
    ) -> OrderResult<Order> {
        let order = self.load(order_id).await?;
        if order.status == OrderStatus::Accepted {
            return Ok(order);
        }
        StatusMachine::transition(order.status, OrderStatus::Accepted)?;
        if is_overdue(&order, now_ms) {
            return Err(OrderError::InvalidTransition(format!(
                "order {} passed its deadline",
                order_id
            )));
        }

        let fare = order.fare.clone().ok_or_else(|| {
            OrderError::Validation(format!("Order {} has no fare bound", order_id))
        })?;
        let claims = self.claims(&order, &fare, now_ms);

        let mut next = order;
        next.status = OrderStatus::Accepted;
        next.provider_id = Some(provider_id.to_string());
        next.accepted_at = Some(now_ms);
        next.updated_at = now_ms;

        let updated = self.write(&next, None, UsageChange::Commit(claims)).await?;

        if let Some(audit) = self.engine.audit() {
            audit.log_commit(order_id, fare.rule_ids(), now_ms).await;
        }
        tracing::info!("Order {} accepted by provider {}", order_id, provider_id);
        Ok(updated)
    }

    /// Driver started the trip
    pub async fn start_trip(&self, order_id: &str, now_ms: i64) -> OrderResult<Order> {
        let order = self.load(order_id).await?;
        if order.status == OrderStatus::InProgress {
            return Ok(order);
        }
        StatusMachine::transition(order.status, OrderStatus::InProgress)?;

        let mut next = order;
        next.status = OrderStatus::InProgress;
        next.started_at = Some(now_ms);
        next.updated_at = now_ms;

        self.write(&next, None, UsageChange::None).await
    }

    /// Trip finished: re-price the bound rules on actual distance and duration
    ///
    /// The difference to the quoted payment is recorded as `fare_supplement`
    /// in the order metadata. Payment becomes pending.
    pub async fn end_trip(
        &self,
        order_id: &str,
        actual_distance_km: Decimal,
        actual_duration_min: Decimal,
        now_ms: i64,
    ) -> OrderResult<Order> {
        let order = self.load(order_id).await?;
        if order.status == OrderStatus::TripEnded {
            return Ok(order);
        }
        StatusMachine::transition(order.status, OrderStatus::TripEnded)?;

        let fare = order.fare.clone().ok_or_else(|| {
            OrderError::Internal(format!("Order {} reached trip end without a fare", order_id))
        })?;
        let mut ctx = order.pricing_context.clone().ok_or_else(|| {
            OrderError::Internal(format!("Order {} has no pricing context", order_id))
        })?;
        ctx.distance_km = actual_distance_km;
        ctx.duration_min = actual_duration_min;

        let repriced = self.engine.reprice(&fare, &ctx).await?;
        let supplement = repriced.payment_amount - fare.payment_amount;
        let promo_rule_ids = self.promo_rule_ids(&fare, &order.promo_codes).await?;

        let mut next = order;
        next.bind_fare(&repriced, &promo_rule_ids);
        next.pricing_context = Some(ctx);
        next.status = OrderStatus::TripEnded;
        next.payment_status = PaymentStatus::Pending;
        next.ended_at = Some(now_ms);
        next.updated_at = now_ms;
        set_metadata(&mut next.metadata, "fare_supplement", json!(supplement.to_string()));

        let ride = self.orders.get_ride(order_id).await?.map(|mut ride| {
            ride.actual_distance_km = Some(actual_distance_km);
            ride.actual_duration_min = Some(actual_duration_min);
            ride.fare = RideFare::from_breakdown(&repriced);
            ride
        });

        let updated = self.write(&next, ride.as_ref(), UsageChange::None).await?;

        if let Some(audit) = self.engine.audit() {
            audit.log_reprice(order_id, &repriced, now_ms).await;
        }
        tracing::info!(
            "Order {} trip ended, payment {} (supplement {})",
            order_id,
            updated.payment_amount,
            supplement
        );
        Ok(updated)
    }

    /// Payment succeeded
    pub async fn complete(&self, order_id: &str, now_ms: i64) -> OrderResult<Order> {
        let order = self.load(order_id).await?;
        if order.status == OrderStatus::Completed {
            return Ok(order);
        }
        StatusMachine::transition(order.status, OrderStatus::Completed)?;

        let mut next = order;
        next.status = OrderStatus::Completed;
        next.payment_status = PaymentStatus::Paid;
        next.completed_at = Some(now_ms);
        next.updated_at = now_ms;

        self.write(&next, None, UsageChange::None).await
    }

    /// Cancel the order and give back its rule usage
    ///
    /// Cancelling an accepted order charges the bound base rule's
    /// cancellation fee, when it has one. Cancelling twice is a no-op.
    pub async fn rollback_on_cancel(
        &self,
        order_id: &str,
        cancelled_by: &str,
        reason: Option<&str>,
        now_ms: i64,
    ) -> OrderResult<Order> {
        let order = self.load(order_id).await?;
        if order.status == OrderStatus::Cancelled {
            return Ok(order);
        }
        StatusMachine::transition(order.status, OrderStatus::Cancelled)?;

        let fee = if order.status == OrderStatus::Accepted {
            self.cancellation_fee(&order).await?
        } else {
            None
        };
        let rule_ids = order
            .fare
            .as_ref()
            .map(FareBreakdown::rule_ids)
            .unwrap_or_default();

        let mut next = order;
        next.status = OrderStatus::Cancelled;
        next.cancelled_at = Some(now_ms);
        next.cancelled_by = Some(cancelled_by.to_string());
        next.cancel_reason = reason.map(str::to_string);
        next.updated_at = now_ms;
        if let Some(fee) = fee {
            next.cancellation_fee = fee;
            next.payment_status = PaymentStatus::Pending;
        }

        let updated = self.write(&next, None, UsageChange::Release).await?;

        if let Some(audit) = self.engine.audit() {
            audit.log_release(order_id, rule_ids, fee, now_ms).await;
        }
        tracing::info!("Order {} cancelled by {}", order_id, cancelled_by);
        Ok(updated)
    }

    /// Expire a requested order whose deadline has passed
    ///
    /// Returns `None` when the order is not due.
    pub async fn expire_if_due(&self, order_id: &str, now_ms: i64) -> OrderResult<Option<Order>> {
        let order = self.load(order_id).await?;
        if order.status != OrderStatus::Requested || !is_overdue(&order, now_ms) {
            return Ok(None);
        }

        let mut next = order;
        next.status = OrderStatus::Expired;
        next.expired_at = Some(now_ms);
        next.updated_at = now_ms;

        let updated = self.write(&next, None, UsageChange::Release).await?;
        tracing::info!("Order {} expired", order_id);
        Ok(Some(updated))
    }

    /// Apply a partial update on top of `expected_version`
    pub async fn patch_order(
        &self,
        order_id: &str,
        expected_version: i64,
        patch: OrderPatch,
        now_ms: i64,
    ) -> OrderResult<Order> {
        let order = self.load(order_id).await?;
        if order.version != expected_version {
            self.metrics.record_version_conflict();
            return Err(OrderError::VersionConflict(order_id.to_string()));
        }
        if patch.is_empty() {
            return Ok(order);
        }

        let mut next = order;
        patch.apply_to(&mut next);
        next.updated_at = now_ms;

        self.write(&next, None, UsageChange::None).await
    }

    /// Order by id, read through the cache
    pub async fn read_order(&self, order_id: &str) -> OrderResult<Order> {
        let key = self.keys.order(order_id);
        if let Some(order) = cache::get_json::<Order>(self.cache.as_ref(), &key).await {
            tracing::debug!("Order {} served from cache", order_id);
            return Ok(order);
        }

        let order = self.load(order_id).await?;
        cache::fill_json(self.cache.as_ref(), &key, &order, cache::ORDER_TTL).await;

        // A write that committed between the load and the fill has already
        // deleted the key, so the entry just filled may be older than the row
        let current = self.load(order_id).await?;
        if current.version != order.version {
            tracing::debug!(
                "Order {} moved from version {} to {} during fill",
                order_id,
                order.version,
                current.version
            );
            self.cache.del(&[key]).await;
        }
        Ok(current)
    }

    pub async fn read_ride(&self, order_id: &str) -> OrderResult<RideOrderDetail> {
        self.orders
            .get_ride(order_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))
    }

    /// Spawn the task that drops expired quotes
    pub fn spawn_quote_purger(
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
                        self.quotes.purge_expired(now_ms).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Quote purger stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn load(&self, order_id: &str) -> OrderResult<Order> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))
    }

    async fn write(
        &self,
        order: &Order,
        ride: Option<&RideOrderDetail>,
        change: UsageChange,
    ) -> OrderResult<Order> {
        let _timer = self.metrics.start_order_update();

        match self.orders.update_versioned(order, ride, change).await {
            Ok(updated) => {
                self.cache.del(&[self.keys.order(&updated.order_id)]).await;
                Ok(updated)
            }
            Err(err) => {
                match &err {
                    OrderError::VersionConflict(id) => {
                        self.metrics.record_version_conflict();
                        tracing::warn!("Version conflict on order {}", id);
                    }
                    OrderError::QuotaExceeded { .. } => self.metrics.record_quota_rejection(),
                    _ => {}
                }
                Err(err)
            }
        }
    }

    fn claims(&self, order: &Order, fare: &FareBreakdown, now_ms: i64) -> Vec<UsageClaim> {
        let day = match &order.pricing_context {
            Some(ctx) => ctx.today(),
            None => PricingContext::new(order.user_id.clone(), Decimal::ZERO, Decimal::ZERO, now_ms)
                .today(),
        };
        usage::claims_for(fare, day)
    }

    async fn cancellation_fee(&self, order: &Order) -> OrderResult<Option<Decimal>> {
        let Some(base_rule_id) = order.fare.as_ref().and_then(|fare| fare.base_rule_id()) else {
            return Ok(None);
        };
        let rule = self.engine.catalog().get_by_id(base_rule_id).await?;
        Ok(rule
            .rates
            .cancellation_fee
            .filter(|fee| *fee > Decimal::ZERO))
    }

    /// Applied rules that came in through one of `codes`
    async fn promo_rule_ids(&self, fare: &FareBreakdown, codes: &[String]) -> OrderResult<Vec<String>> {
        let mut ids = Vec::new();
        if codes.is_empty() {
            return Ok(ids);
        }
        for applied in &fare.applied_rules {
            let rule = self.engine.catalog().get_by_id(&applied.rule_id).await?;
            let Some(promo_code) = rule.code.promo_code.as_deref() else {
                continue;
            };
            let matched = codes.iter().any(|code| {
                if rule.code.case_sensitive {
                    code == promo_code
                } else {
                    code.eq_ignore_ascii_case(promo_code)
                }
            });
            if matched {
                ids.push(applied.rule_id.clone());
            }
        }
        Ok(ids)
    }
}

fn is_overdue(order: &Order, now_ms: i64) -> bool {
    order.expires_at.map_or(false, |deadline| deadline < now_ms)
}

fn set_metadata(metadata: &mut JsonValue, key: &str, value: JsonValue) {
    if !metadata.is_object() {
        *metadata = json!({});
    }
    if let Some(map) = metadata.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::memory::MemoryStore;
    use crate::orders::Location;
    use crate::pricing::test_support::*;
    use crate::pricing::PriceRule;
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
        binder: Arc<OrderFareBinder>,
    }

    async fn harness(rules: Vec<PriceRule>) -> Harness {
        let (store, engine) = engine(rules).await;
        let cache = Arc::new(MemoryCache::new());
        let binder = Arc::new(OrderFareBinder::new(
            Arc::new(engine),
            store.clone(),
            cache.clone(),
            CacheKeys::new("test"),
        ));
        Harness {
            store,
            cache,
            binder,
        }
    }

    fn new_order(order_id: &str, user_id: &str) -> NewRideOrder {
        let point = |address: &str| Location {
            address: address.to_string(),
            lat: dec!(48.8566),
            lng: dec!(2.3522),
            landmark: None,
        };
        NewRideOrder {
            order_id: order_id.to_string(),
            user_id: user_id.to_string(),
            currency: "USD".to_string(),
            vehicle_category: Some("car".to_string()),
            vehicle_level: None,
            passenger_count: 1,
            pickup: point("1 Main St"),
            dropoff: point("9 Side St"),
            estimated_distance_km: dec!(10),
            estimated_duration_min: dec!(20),
            scheduled_at: None,
            expires_at: None,
            metadata: JsonValue::Null,
        }
    }

    fn capped_once() -> PriceRule {
        let mut rule = fixed_off("once", dec!(3.00));
        rule.limits.max_usage_total = Some(1);
        rule
    }

    async fn bound_order(h: &Harness, order_id: &str, user_id: &str) -> (Quote, Order) {
        h.binder.create_order(new_order(order_id, user_id), NOW).await.unwrap();
        let mut ctx = ctx();
        ctx.user_id = user_id.to_string();
        let quote = h.binder.quote(ctx, &[]).await.unwrap();
        let order = h
            .binder
            .attach_quote(order_id, &quote.quote_id, NOW + 1)
            .await
            .unwrap();
        (quote, order)
    }

    #[tokio::test]
    async fn test_attach_round_trips_breakdown() {
        let h = harness(vec![city_base(), surge(dec!(1.5)), percent_off("twenty", dec!(20), Some(dec!(10)))]).await;
        let (quote, attached) = bound_order(&h, "o-1", "rider-1").await;
        assert_eq!(attached.version, 2);

        // First read fills the cache, second is served from it
        let read = h.binder.read_order("o-1").await.unwrap();
        assert!(h.cache.contains("test:order:o-1").await);
        let cached = h.binder.read_order("o-1").await.unwrap();

        assert_eq!(read.fare.as_ref(), Some(&quote.breakdown));
        assert_eq!(cached.fare.as_ref(), Some(&quote.breakdown));
        assert_eq!(read.payment_amount, quote.breakdown.payment_amount);
        assert_eq!(read.quote_id.as_deref(), Some(quote.quote_id.as_str()));

        let ride = h.binder.read_ride("o-1").await.unwrap();
        assert_eq!(ride.fare.total, dec!(34.50));
    }

    #[tokio::test]
    async fn test_write_invalidates_cached_order() {
        let h = harness(vec![city_base()]).await;
        bound_order(&h, "o-1", "rider-1").await;
        h.binder.read_order("o-1").await.unwrap();
        assert!(h.cache.contains("test:order:o-1").await);

        h.binder.commit_on_accept("o-1", "driver-7", NOW + 2).await.unwrap();
        assert!(!h.cache.contains("test:order:o-1").await);
        let read = h.binder.read_order("o-1").await.unwrap();
        assert_eq!(read.status, OrderStatus::Accepted);
    }

    /// Commits a write on the first `get_order` after being armed, just after
    /// the read has been served
    struct WriteDuringRead {
        inner: Arc<MemoryStore>,
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl OrderStore for WriteDuringRead {
        async fn insert_order(&self, order: &Order, ride: Option<&RideOrderDetail>) -> OrderResult<()> {
            self.inner.insert_order(order, ride).await
        }

        async fn get_order(&self, order_id: &str) -> OrderResult<Option<Order>> {
            let found = self.inner.get_order(order_id).await?;
            if let Some(order) = &found {
                if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                    let mut next = order.clone();
                    next.provider_id = Some("driver-9".to_string());
                    self.inner.update_versioned(&next, None, UsageChange::None).await?;
                }
            }
            Ok(found)
        }

        async fn get_ride(&self, order_id: &str) -> OrderResult<Option<RideOrderDetail>> {
            self.inner.get_ride(order_id).await
        }

        async fn update_versioned(
            &self,
            order: &Order,
            ride: Option<&RideOrderDetail>,
            usage: UsageChange,
        ) -> OrderResult<Order> {
            self.inner.update_versioned(order, ride, usage).await
        }
    }

    #[tokio::test]
    async fn test_write_during_cache_fill_leaves_no_stale_entry() {
        let (store, engine) = engine(vec![city_base()]).await;
        let orders = Arc::new(WriteDuringRead {
            inner: store.clone(),
            armed: std::sync::atomic::AtomicBool::new(false),
        });
        let cache = Arc::new(MemoryCache::new());
        let binder = OrderFareBinder::new(
            Arc::new(engine),
            orders.clone(),
            cache.clone(),
            CacheKeys::new("test"),
        );
        let created = binder.create_order(new_order("o-1", "rider-1"), NOW).await.unwrap();

        orders.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        let read = binder.read_order("o-1").await.unwrap();

        assert_eq!(read.version, created.version + 1);
        assert_eq!(read.provider_id.as_deref(), Some("driver-9"));
        assert!(!cache.contains("test:order:o-1").await);

        let again = binder.read_order("o-1").await.unwrap();
        assert_eq!(again.version, created.version + 1);
        assert!(cache.contains("test:order:o-1").await);
    }

    #[tokio::test]
    async fn test_expired_quote_cannot_attach() {
        let h = harness(vec![city_base()]).await;
        h.binder.create_order(new_order("o-1", "rider-1"), NOW).await.unwrap();
        let quote = h.binder.quote(ctx(), &[]).await.unwrap();

        let late = quote.expires_at_ms;
        let result = h.binder.attach_quote("o-1", &quote.quote_id, late).await;
        assert!(matches!(result, Err(OrderError::QuoteExpired(_))));
    }

    #[tokio::test]
    async fn test_quote_for_other_user_is_rejected() {
        let h = harness(vec![city_base()]).await;
        h.binder.create_order(new_order("o-1", "rider-2"), NOW).await.unwrap();
        let quote = h.binder.quote(ctx(), &[]).await.unwrap();

        let result = h.binder.attach_quote("o-1", &quote.quote_id, NOW).await;
        assert!(matches!(result, Err(OrderError::Validation(_))));
    }

    #[tokio::test]
    async fn test_s3_quota_exhaustion_recomputes_without_rule() {
        let h = harness(vec![city_base(), capped_once()]).await;
        for (order_id, user_id) in [("o-1", "rider-1"), ("o-2", "rider-2")] {
            h.binder.create_order(new_order(order_id, user_id), NOW).await.unwrap();
        }
        let mut first_ctx = ctx();
        first_ctx.user_id = "rider-1".to_string();
        let mut second_ctx = ctx();
        second_ctx.user_id = "rider-2".to_string();
        let first = h.binder.quote(first_ctx, &[]).await.unwrap();
        let second = h.binder.quote(second_ctx, &[]).await.unwrap();
        assert!(first.breakdown.rule_ids().contains(&"once".to_string()));
        assert!(second.breakdown.rule_ids().contains(&"once".to_string()));

        let (a, b) = tokio::join!(
            h.binder.attach_quote("o-1", &first.quote_id, NOW + 1),
            h.binder.attach_quote("o-2", &second.quote_id, NOW + 1),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let with_rule = [&a, &b]
            .iter()
            .filter(|order| {
                order
                    .fare
                    .as_ref()
                    .map_or(false, |fare| fare.rule_ids().contains(&"once".to_string()))
            })
            .count();
        assert_eq!(with_rule, 1);
        for order in [&a, &b] {
            assert!(order.fare.as_ref().unwrap().base_rule_id() == Some("base"));
        }
        assert_eq!(h.store.rule("once").await.unwrap().limits.usage_count, 1);
    }

    #[tokio::test]
    async fn test_commit_twice_increments_once() {
        let h = harness(vec![city_base(), fixed_off("promo", dec!(1.00))]).await;
        bound_order(&h, "o-1", "rider-1").await;

        let first = h.binder.commit_on_accept("o-1", "driver-7", NOW + 2).await.unwrap();
        let second = h.binder.commit_on_accept("o-1", "driver-7", NOW + 3).await.unwrap();

        assert_eq!(first.version, second.version);
        assert_eq!(h.store.rule("promo").await.unwrap().limits.usage_count, 1);
        let day = ctx().today();
        assert_eq!(h.store.usage_for("promo", "rider-1", day).await, 1);
    }

    #[tokio::test]
    async fn test_s6_cancel_releases_reservation() {
        let h = harness(vec![city_base(), fixed_off("promo", dec!(1.00))]).await;
        bound_order(&h, "o-1", "rider-1").await;
        let accepted = h.binder.commit_on_accept("o-1", "driver-7", NOW + 2).await.unwrap();
        let day = ctx().today();
        assert_eq!(h.store.usage_for("promo", "rider-1", day).await, 1);

        let cancelled = h
            .binder
            .rollback_on_cancel("o-1", "rider-1", Some("changed plans"), NOW + 3)
            .await
            .unwrap();

        assert_eq!(h.store.usage_for("promo", "rider-1", day).await, 0);
        assert_eq!(h.store.rule("promo").await.unwrap().limits.usage_count, 0);
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(NOW + 3));
        assert_eq!(cancelled.version, accepted.version + 1);
        // Cancelling after acceptance charges the base rule's fee
        assert_eq!(cancelled.cancellation_fee, dec!(4.00));
        assert_eq!(cancelled.payment_status, PaymentStatus::Pending);

        let again = h
            .binder
            .rollback_on_cancel("o-1", "rider-1", None, NOW + 4)
            .await
            .unwrap();
        assert_eq!(again.version, cancelled.version);
        assert_eq!(h.store.rule("promo").await.unwrap().limits.usage_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_accept_has_no_fee() {
        let h = harness(vec![city_base()]).await;
        bound_order(&h, "o-1", "rider-1").await;
        let cancelled = h
            .binder
            .rollback_on_cancel("o-1", "rider-1", None, NOW + 2)
            .await
            .unwrap();
        assert_eq!(cancelled.cancellation_fee, Decimal::ZERO);
        assert_eq!(cancelled.payment_status, PaymentStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_full_lifecycle_reprices_on_actuals() {
        let h = harness(vec![city_base(), percent_off("ten", dec!(10), None)]).await;
        bound_order(&h, "o-1", "rider-1").await;
        h.binder.commit_on_accept("o-1", "driver-7", NOW + 2).await.unwrap();
        h.binder.start_trip("o-1", NOW + 3).await.unwrap();

        let ended = h
            .binder
            .end_trip("o-1", dec!(12), dec!(20), NOW + 4)
            .await
            .unwrap();
        assert_eq!(ended.status, OrderStatus::TripEnded);
        assert_eq!(ended.payment_status, PaymentStatus::Pending);
        assert_eq!(ended.original_amount, dec!(26.00));
        assert_eq!(ended.discounted_amount, dec!(23.40));
        // Quoted 23.00 - 2.30 = 20.70, so the supplement is 2.70
        assert_eq!(ended.metadata["fare_supplement"], json!("2.70"));

        let ride = h.binder.read_ride("o-1").await.unwrap();
        assert_eq!(ride.actual_distance_km, Some(dec!(12)));

        let completed = h.binder.complete("o-1", NOW + 5).await.unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        assert_eq!(completed.payment_status, PaymentStatus::Paid);
        assert_eq!(completed.completed_at, Some(NOW + 5));
    }

    #[tokio::test]
    async fn test_invalid_transitions_are_rejected() {
        let h = harness(vec![city_base()]).await;
        bound_order(&h, "o-1", "rider-1").await;

        let result = h.binder.start_trip("o-1", NOW + 2).await;
        assert!(matches!(result, Err(OrderError::InvalidTransition(_))));

        h.binder.commit_on_accept("o-1", "driver-7", NOW + 2).await.unwrap();
        h.binder.start_trip("o-1", NOW + 3).await.unwrap();
        let result = h.binder.rollback_on_cancel("o-1", "rider-1", None, NOW + 4).await;
        assert!(matches!(result, Err(OrderError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_expire_if_due_releases_usage() {
        let h = harness(vec![city_base(), fixed_off("promo", dec!(1.00))]).await;
        let mut request = new_order("o-1", "rider-1");
        request.expires_at = Some(NOW + 100);
        h.binder.create_order(request, NOW).await.unwrap();
        let quote = h.binder.quote(ctx(), &[]).await.unwrap();
        h.binder.attach_quote("o-1", &quote.quote_id, NOW + 1).await.unwrap();
        assert_eq!(h.store.rule("promo").await.unwrap().limits.usage_count, 1);

        assert!(h.binder.expire_if_due("o-1", NOW + 100).await.unwrap().is_none());
        let expired = h.binder.expire_if_due("o-1", NOW + 101).await.unwrap().unwrap();
        assert_eq!(expired.status, OrderStatus::Expired);
        assert_eq!(expired.expired_at, Some(NOW + 101));
        assert_eq!(h.store.rule("promo").await.unwrap().limits.usage_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_patches_one_wins() {
        let h = harness(vec![city_base()]).await;
        let order = h.binder.create_order(new_order("o-1", "rider-1"), NOW).await.unwrap();

        let patch = |provider: &str| OrderPatch {
            provider_id: Some(Some(provider.to_string())),
            ..Default::default()
        };
        let (a, b) = tokio::join!(
            h.binder.patch_order("o-1", order.version, patch("d-1"), NOW + 1),
            h.binder.patch_order("o-1", order.version, patch("d-2"), NOW + 1),
        );

        let outcomes = [a, b];
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(OrderError::VersionConflict(_))))
            .count();
        assert_eq!((wins, conflicts), (1, 1));
        assert_eq!(h.store.order("o-1").await.unwrap().version, order.version + 1);
    }

    #[tokio::test]
    async fn test_backend_outage_surfaces_retry_hint() {
        use crate::error::Classify;

        let h = harness(vec![city_base()]).await;
        let (_quote, order) = bound_order(&h, "o-1", "rider-1").await;
        h.store.set_available(false).await;

        let err = h
            .binder
            .patch_order("o-1", order.version, OrderPatch::default(), NOW)
            .await
            .unwrap_err();
        assert!(err.retry_after().is_some());
    }
}
