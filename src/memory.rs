// In-memory storage backend
//
// Implements every store trait over one mutex-guarded state so a versioned
// order update and its usage change commit together, mirroring the Postgres
// transaction. Used by tests and by the worker when no database is configured.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::orders::error::{OrderError, OrderResult};
use crate::orders::repository::{OrderStore, UsageChange};
use crate::orders::{Order, RideOrderDetail};
use crate::pricing::error::{PricingError, PricingResult};
use crate::pricing::repository::RuleStore;
use crate::pricing::rule::PriceRule;
use crate::pricing::types::RuleStatus;
use crate::pricing::usage::{ReservationStatus, UsageClaim, UsageReservation, UsageStore};

const UNAVAILABLE: &str = "memory store marked unavailable";

#[derive(Debug, Default, Clone)]
struct Counters {
    rules: HashMap<String, PriceRule>,
    /// (rule_id, user_id, day) → uses
    usage: HashMap<(String, String, NaiveDate), i64>,
    /// (rule_id, order_id) → reservation
    reservations: BTreeMap<(String, String), UsageReservation>,
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: Counters,
    orders: HashMap<String, Order>,
    rides: HashMap<String, RideOrderDetail>,
}

impl Counters {
    fn user_total(&self, rule_id: &str, user_id: &str) -> i64 {
        self.usage
            .iter()
            .filter(|((rule, user, _), _)| rule == rule_id && user == user_id)
            .map(|(_, count)| *count)
            .sum()
    }

    fn holds(&self, rule_id: &str, order_id: &str) -> bool {
        self.reservations
            .get(&(rule_id.to_string(), order_id.to_string()))
            .map_or(false, |r| r.status.holds_usage())
    }

    /// All-or-nothing: every claim is checked before any counter moves
    fn reserve(
        &mut self,
        claims: &[UsageClaim],
        user_id: &str,
        order_id: &str,
        now_ms: i64,
    ) -> PricingResult<()> {
        let pending: Vec<&UsageClaim> = claims
            .iter()
            .filter(|claim| !self.holds(&claim.rule_id, order_id))
            .collect();

        for claim in &pending {
            let rule = self
                .rules
                .get(&claim.rule_id)
                .ok_or_else(|| PricingError::RuleNotFound(claim.rule_id.clone()))?;
            let limits = &rule.limits;
            let exceeded = limits.max_usage_total.map_or(false, |cap| limits.usage_count >= cap)
                || limits
                    .max_usage_per_day
                    .map_or(false, |cap| limits.usage_on(claim.day) >= cap)
                || limits
                    .max_usage_per_user
                    .map_or(false, |cap| self.user_total(&claim.rule_id, user_id) >= cap);
            if exceeded {
                return Err(PricingError::QuotaExceeded {
                    rule_id: claim.rule_id.clone(),
                });
            }
        }

        for claim in pending {
            if let Some(rule) = self.rules.get_mut(&claim.rule_id) {
                let limits = &mut rule.limits;
                limits.usage_count += 1;
                if limits.usage_day.map_or(true, |current| current <= claim.day) {
                    limits.usage_today = limits.usage_on(claim.day) + 1;
                    limits.usage_day = Some(claim.day);
                }
            }
            *self
                .usage
                .entry((claim.rule_id.clone(), user_id.to_string(), claim.day))
                .or_insert(0) += 1;
            self.reservations.insert(
                (claim.rule_id.clone(), order_id.to_string()),
                UsageReservation {
                    rule_id: claim.rule_id.clone(),
                    order_id: order_id.to_string(),
                    user_id: user_id.to_string(),
                    day: claim.day,
                    status: ReservationStatus::Reserved,
                    reserved_at_ms: now_ms,
                },
            );
        }
        Ok(())
    }

    fn confirm(&mut self, order_id: &str) -> u64 {
        let mut confirmed = 0;
        for reservation in self.reservations.values_mut() {
            if reservation.order_id == order_id && reservation.status == ReservationStatus::Reserved {
                reservation.status = ReservationStatus::Confirmed;
                confirmed += 1;
            }
        }
        confirmed
    }

    fn release(&mut self, order_id: &str) -> u64 {
        let mut released = Vec::new();
        for reservation in self.reservations.values_mut() {
            if reservation.order_id == order_id && reservation.status.holds_usage() {
                reservation.status = ReservationStatus::Released;
                released.push((
                    reservation.rule_id.clone(),
                    reservation.user_id.clone(),
                    reservation.day,
                ));
            }
        }

        for (rule_id, user_id, day) in &released {
            if let Some(rule) = self.rules.get_mut(rule_id) {
                let limits = &mut rule.limits;
                limits.usage_count = (limits.usage_count - 1).max(0);
                if limits.usage_day == Some(*day) {
                    limits.usage_today = (limits.usage_today - 1).max(0);
                }
            }
            if let Some(count) = self
                .usage
                .get_mut(&(rule_id.clone(), user_id.clone(), *day))
            {
                *count = (*count - 1).max(0);
            }
        }
        released.len() as u64
    }

    fn apply(&mut self, order: &Order, change: &UsageChange) -> PricingResult<()> {
        let now_ms = order.updated_at;
        match change {
            UsageChange::None => {}
            UsageChange::Rebind(claims) => {
                self.release(&order.order_id);
                self.reserve(claims, &order.user_id, &order.order_id, now_ms)?;
            }
            UsageChange::Commit(claims) => {
                self.reserve(claims, &order.user_id, &order.order_id, now_ms)?;
                self.confirm(&order.order_id);
            }
            UsageChange::Release => {
                self.release(&order.order_id);
            }
        }
        Ok(())
    }
}

/// In-memory implementation of `RuleStore`, `UsageStore` and `OrderStore`
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every store call fails while unavailable
    pub async fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Insert or replace a rule, counters included
    pub async fn put_rule(&self, rule: PriceRule) {
        self.state
            .lock()
            .await
            .counters
            .rules
            .insert(rule.rule_id.clone(), rule);
    }

    pub async fn rule(&self, rule_id: &str) -> Option<PriceRule> {
        self.state.lock().await.counters.rules.get(rule_id).cloned()
    }

    /// Uses of `rule_id` by `user_id` charged to `day`
    pub async fn usage_for(&self, rule_id: &str, user_id: &str, day: NaiveDate) -> i64 {
        self.state
            .lock()
            .await
            .counters
            .usage
            .get(&(rule_id.to_string(), user_id.to_string(), day))
            .copied()
            .unwrap_or(0)
    }

    pub async fn order(&self, order_id: &str) -> Option<Order> {
        self.state.lock().await.orders.get(order_id).cloned()
    }

    fn check_pricing(&self) -> PricingResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PricingError::Backend(UNAVAILABLE.to_string()))
        }
    }

    fn check_orders(&self) -> OrderResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrderError::backend(UNAVAILABLE))
        }
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn load_rules(&self) -> PricingResult<Vec<PriceRule>> {
        self.check_pricing()?;
        let state = self.state.lock().await;
        let mut rules: Vec<PriceRule> = state
            .counters
            .rules
            .values()
            .filter(|rule| rule.status != RuleStatus::Deleted)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        Ok(rules)
    }

    async fn get_rule(&self, rule_id: &str) -> PricingResult<Option<PriceRule>> {
        self.check_pricing()?;
        Ok(self.state.lock().await.counters.rules.get(rule_id).cloned())
    }

    async fn insert_rule(&self, rule: &PriceRule) -> PricingResult<()> {
        self.check_pricing()?;
        let mut state = self.state.lock().await;
        if state.counters.rules.contains_key(&rule.rule_id) {
            return Err(PricingError::Validation(format!(
                "Price rule {} already exists",
                rule.rule_id
            )));
        }
        state
            .counters
            .rules
            .insert(rule.rule_id.clone(), rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &PriceRule, expected_version: i64) -> PricingResult<()> {
        self.check_pricing()?;
        let mut state = self.state.lock().await;
        let stored = state
            .counters
            .rules
            .get_mut(&rule.rule_id)
            .ok_or_else(|| PricingError::RuleNotFound(rule.rule_id.clone()))?;
        if stored.version != expected_version {
            return Err(PricingError::VersionConflict(rule.rule_id.clone()));
        }

        let mut updated = rule.clone();
        updated.limits.usage_count = stored.limits.usage_count;
        updated.limits.usage_today = stored.limits.usage_today;
        updated.limits.usage_day = stored.limits.usage_day;
        *stored = updated;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn reserve(
        &self,
        claims: &[UsageClaim],
        user_id: &str,
        order_id: &str,
        now_ms: i64,
    ) -> PricingResult<()> {
        self.check_pricing()?;
        self.state
            .lock()
            .await
            .counters
            .reserve(claims, user_id, order_id, now_ms)
    }

    async fn confirm(&self, order_id: &str, _now_ms: i64) -> PricingResult<u64> {
        self.check_pricing()?;
        Ok(self.state.lock().await.counters.confirm(order_id))
    }

    async fn release(&self, order_id: &str, _now_ms: i64) -> PricingResult<u64> {
        self.check_pricing()?;
        Ok(self.state.lock().await.counters.release(order_id))
    }

    async fn user_usage(&self, rule_id: &str, user_id: &str) -> PricingResult<i64> {
        self.check_pricing()?;
        Ok(self.state.lock().await.counters.user_total(rule_id, user_id))
    }

    async fn stale_orders(&self, cutoff_ms: i64) -> PricingResult<Vec<String>> {
        self.check_pricing()?;
        let state = self.state.lock().await;
        let mut orders: Vec<String> = state
            .counters
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Reserved && r.reserved_at_ms < cutoff_ms)
            .map(|r| r.order_id.clone())
            .collect();
        orders.sort();
        orders.dedup();
        Ok(orders)
    }

    async fn reservations(&self, order_id: &str) -> PricingResult<Vec<UsageReservation>> {
        self.check_pricing()?;
        let state = self.state.lock().await;
        Ok(state
            .counters
            .reservations
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: &Order, ride: Option<&RideOrderDetail>) -> OrderResult<()> {
        self.check_orders()?;
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.order_id) {
            return Err(OrderError::Validation(format!(
                "Order {} already exists",
                order.order_id
            )));
        }
        state.orders.insert(order.order_id.clone(), order.clone());
        if let Some(ride) = ride {
            state.rides.insert(order.order_id.clone(), ride.clone());
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> OrderResult<Option<Order>> {
        self.check_orders()?;
        Ok(self.state.lock().await.orders.get(order_id).cloned())
    }

    async fn get_ride(&self, order_id: &str) -> OrderResult<Option<RideOrderDetail>> {
        self.check_orders()?;
        Ok(self.state.lock().await.rides.get(order_id).cloned())
    }

    async fn update_versioned(
        &self,
        order: &Order,
        ride: Option<&RideOrderDetail>,
        usage: UsageChange,
    ) -> OrderResult<Order> {
        self.check_orders()?;
        let mut state = self.state.lock().await;

        let stored_version = state
            .orders
            .get(&order.order_id)
            .map(|stored| stored.version)
            .ok_or_else(|| OrderError::NotFound(order.order_id.clone()))?;
        if stored_version != order.version {
            return Err(OrderError::VersionConflict(order.order_id.clone()));
        }

        // Work on a copy so a refused reservation leaves every counter untouched
        let mut counters = state.counters.clone();
        counters.apply(order, &usage)?;
        state.counters = counters;

        let mut next = order.clone();
        next.version = order.version + 1;
        state.orders.insert(next.order_id.clone(), next.clone());
        if let Some(ride) = ride {
            state.rides.insert(next.order_id.clone(), ride.clone());
        }
        Ok(next)
    }
}
