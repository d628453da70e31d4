// Rule Catalog
//
// Typed in-memory projection of the persisted price rules. Readers take an
// `Arc<RuleSnapshot>` and never observe a partially built catalog; a reload
// builds a fresh snapshot and swaps the reference. Snapshots go stale after a
// TTL (60 seconds by default) or on an explicit invalidation.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::cache::{self, Cache, CacheKeys};
use crate::pricing::error::{PricingError, PricingResult};
use crate::pricing::metrics::PerformanceMetrics;
use crate::pricing::repository::RuleStore;
use crate::pricing::rule::PriceRule;
use crate::pricing::types::{RuleCategory, RuleStatus};

/// Default snapshot time-to-live
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(60);

/// Wait after a failed reload before the store is tried again, capped at the TTL
pub const RELOAD_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Ordering used wherever duplicate rules must resolve to one: smallest
/// priority, then most recently updated, then rule id
fn preference_key(rule: &PriceRule) -> (i32, Reverse<i64>, &str) {
    (rule.priority(), Reverse(rule.updated_at), rule.rule_id.as_str())
}

/// Immutable view of the catalog
#[derive(Debug)]
pub struct RuleSnapshot {
    /// Valid, non-deleted rules ordered by (priority, rule_id)
    rules: Vec<Arc<PriceRule>>,
    by_id: HashMap<String, Arc<PriceRule>>,
    by_category: HashMap<RuleCategory, Vec<Arc<PriceRule>>>,
    /// Case-sensitive rules keyed by their exact (trimmed) code
    by_exact_code: HashMap<String, Vec<Arc<PriceRule>>>,
    /// Case-insensitive rules keyed by their lower-cased code
    by_folded_code: HashMap<String, Vec<Arc<PriceRule>>>,
    /// Rules excluded because they failed load-time validation
    invalid_rules: Vec<(String, String)>,
    loaded_at: Instant,
}

impl RuleSnapshot {
    /// Build a snapshot, dropping deleted rules and rules that fail validation
    pub fn build(rules: Vec<PriceRule>) -> Self {
        let mut valid = Vec::with_capacity(rules.len());
        let mut invalid_rules = Vec::new();

        for rule in rules {
            if rule.status == RuleStatus::Deleted {
                continue;
            }
            match rule.validate() {
                Ok(()) => valid.push(Arc::new(rule)),
                Err(err) => {
                    tracing::error!("Excluding price rule {} from catalog: {}", rule.rule_id, err);
                    invalid_rules.push((rule.rule_id.clone(), err.to_string()));
                }
            }
        }

        valid.sort_by(|a, b| {
            (a.priority(), a.rule_id.as_str()).cmp(&(b.priority(), b.rule_id.as_str()))
        });

        let mut by_id = HashMap::with_capacity(valid.len());
        let mut by_category: HashMap<RuleCategory, Vec<Arc<PriceRule>>> = HashMap::new();
        let mut by_exact_code: HashMap<String, Vec<Arc<PriceRule>>> = HashMap::new();
        let mut by_folded_code: HashMap<String, Vec<Arc<PriceRule>>> = HashMap::new();

        for rule in &valid {
            by_id.insert(rule.rule_id.clone(), Arc::clone(rule));
            by_category
                .entry(rule.category)
                .or_default()
                .push(Arc::clone(rule));

            if let Some(code) = rule.code.promo_code.as_deref().map(str::trim) {
                if code.is_empty() {
                    continue;
                }
                if rule.code.case_sensitive {
                    by_exact_code
                        .entry(code.to_string())
                        .or_default()
                        .push(Arc::clone(rule));
                } else {
                    by_folded_code
                        .entry(code.to_lowercase())
                        .or_default()
                        .push(Arc::clone(rule));
                }
            }
        }

        Self {
            rules: valid,
            by_id,
            by_category,
            by_exact_code,
            by_folded_code,
            invalid_rules,
            loaded_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Arc<PriceRule>] {
        &self.rules
    }

    pub fn invalid_rules(&self) -> &[(String, String)] {
        &self.invalid_rules
    }

    pub fn get(&self, rule_id: &str) -> Option<Arc<PriceRule>> {
        self.by_id.get(rule_id).cloned()
    }

    pub fn by_category(&self, category: RuleCategory) -> &[Arc<PriceRule>] {
        self.by_category
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Look a code up among case-sensitive rules (exact match) or
    /// case-insensitive rules (folded match)
    ///
    /// Only rules whose effective status is active at `now_ms` are considered,
    /// so a closed window or exhausted total never claims a code from a live
    /// duplicate. Duplicates resolve by `preference_key`.
    pub fn find_code(
        &self,
        code: &str,
        case_sensitive: bool,
        now_ms: i64,
    ) -> Option<Arc<PriceRule>> {
        let bucket = if case_sensitive {
            self.by_exact_code.get(code)
        } else {
            self.by_folded_code.get(&code.to_lowercase())
        }?;

        bucket
            .iter()
            .filter(|rule| rule.effective_status(now_ms) == RuleStatus::Active)
            .min_by(|a, b| preference_key(a).cmp(&preference_key(b)))
            .cloned()
    }

    /// Coarse prefilter: rules whose effective status is active at `now_ms`
    pub fn list_applicable(&self, now_ms: i64) -> Vec<Arc<PriceRule>> {
        self.rules
            .iter()
            .filter(|rule| rule.effective_status(now_ms) == RuleStatus::Active)
            .cloned()
            .collect()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() < ttl
    }
}

/// Rule Catalog
///
/// Single-writer, many-reader holder of the current `RuleSnapshot`.
pub struct RuleCatalog {
    store: Arc<dyn RuleStore>,
    cache: Arc<dyn Cache>,
    keys: CacheKeys,
    ttl: Duration,
    current: RwLock<Option<Arc<RuleSnapshot>>>,
    reload_lock: Mutex<()>,
    invalidated: AtomicBool,
    /// Set after a failed reload; the last snapshot is served until it passes
    retry_not_before: StdMutex<Option<Instant>>,
    metrics: PerformanceMetrics,
}

impl RuleCatalog {
    pub fn new(
        store: Arc<dyn RuleStore>,
        cache: Arc<dyn Cache>,
        keys: CacheKeys,
        ttl: Duration,
        metrics: PerformanceMetrics,
    ) -> Self {
        Self {
            store,
            cache,
            keys,
            ttl,
            current: RwLock::new(None),
            reload_lock: Mutex::new(()),
            invalidated: AtomicBool::new(false),
            retry_not_before: StdMutex::new(None),
            metrics,
        }
    }

    /// Load (or reload) the catalog from the store
    ///
    /// Fails with `CatalogUnavailable` only when no snapshot has ever loaded;
    /// afterwards a failed reload keeps serving the last good snapshot.
    pub async fn load(&self) -> PricingResult<Arc<RuleSnapshot>> {
        let _guard = self.reload_lock.lock().await;
        self.reload_locked().await
    }

    async fn reload_locked(&self) -> PricingResult<Arc<RuleSnapshot>> {
        let _timer = self.metrics.start_catalog_reload();

        match self.store.load_rules().await {
            Ok(rules) => {
                let snapshot = Arc::new(RuleSnapshot::build(rules));
                tracing::info!(
                    "Rule catalog loaded: {} rules ({} invalid)",
                    snapshot.len(),
                    snapshot.invalid_rules.len()
                );
                self.invalidated.store(false, Ordering::Release);
                self.set_retry_not_before(None);
                *self.current.write().await = Some(Arc::clone(&snapshot));
                Ok(snapshot)
            }
            Err(err) => match self.current.read().await.clone() {
                Some(previous) => {
                    self.metrics.record_catalog_reload_failure();
                    let backoff = self.ttl.min(RELOAD_RETRY_BACKOFF);
                    self.set_retry_not_before(Some(Instant::now() + backoff));
                    tracing::warn!(
                        "Rule catalog reload failed, serving last snapshot for {:?}: {}",
                        backoff,
                        err
                    );
                    Ok(previous)
                }
                None => {
                    self.metrics.record_catalog_reload_failure();
                    tracing::error!("Rule catalog unavailable: {}", err);
                    Err(PricingError::CatalogUnavailable(err.to_string()))
                }
            },
        }
    }

    fn needs_reload(&self, snapshot: &RuleSnapshot) -> bool {
        if self.backing_off() {
            return false;
        }
        self.invalidated.load(Ordering::Acquire) || !snapshot.is_fresh(self.ttl)
    }

    fn backing_off(&self) -> bool {
        match self.retry_not_before.lock() {
            Ok(guard) => guard.map_or(false, |until| Instant::now() < until),
            Err(poisoned) => poisoned
                .into_inner()
                .map_or(false, |until| Instant::now() < until),
        }
    }

    fn set_retry_not_before(&self, until: Option<Instant>) {
        match self.retry_not_before.lock() {
            Ok(mut guard) => *guard = until,
            Err(poisoned) => *poisoned.into_inner() = until,
        }
    }

    /// Current snapshot, reloading first when stale
    pub async fn snapshot(&self) -> PricingResult<Arc<RuleSnapshot>> {
        {
            let current = self.current.read().await;
            if let Some(snapshot) = current.as_ref() {
                if !self.needs_reload(snapshot) {
                    return Ok(Arc::clone(snapshot));
                }
            }
        }
        self.refresh_if_stale().await
    }

    /// Reload when the snapshot is missing, expired or invalidated
    ///
    /// Concurrent callers queue on the reload lock and re-check, so a burst of
    /// readers at expiry triggers a single reload.
    pub async fn refresh_if_stale(&self) -> PricingResult<Arc<RuleSnapshot>> {
        let _guard = self.reload_lock.lock().await;

        // Double-check after acquiring the lock
        if let Some(snapshot) = self.current.read().await.as_ref() {
            if !self.needs_reload(snapshot) {
                return Ok(Arc::clone(snapshot));
            }
        }

        self.reload_locked().await
    }

    /// Out-of-band invalidation
    ///
    /// Marks the snapshot stale and lifts any reload backoff. Cached rule
    /// entries go too: one entry for `Some(rule_id)`, all of them for `None`.
    pub async fn invalidate(&self, rule_id: Option<&str>) {
        self.invalidated.store(true, Ordering::Release);
        self.set_retry_not_before(None);
        match rule_id {
            Some(id) => self.cache.del(&[self.keys.price_rule(id)]).await,
            None => {
                let removed = self.cache.scan_delete(&self.keys.price_rule_pattern()).await;
                tracing::debug!("Dropped {} cached price rules", removed);
            }
        }
    }

    /// Rule by id: snapshot first, then cache, then store
    pub async fn get_by_id(&self, rule_id: &str) -> PricingResult<Arc<PriceRule>> {
        let snapshot = self.snapshot().await?;
        if let Some(rule) = snapshot.get(rule_id) {
            return Ok(rule);
        }

        let key = self.keys.price_rule(rule_id);
        if let Some(rule) = cache::get_json::<PriceRule>(self.cache.as_ref(), &key).await {
            self.metrics.record_cache_hit();
            return Ok(Arc::new(rule));
        }
        self.metrics.record_cache_miss();

        tracing::debug!("Rule {} not in snapshot, reading through to store", rule_id);
        let rule = self
            .store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| PricingError::RuleNotFound(rule_id.to_string()))?;

        cache::fill_json(self.cache.as_ref(), &key, &rule, cache::PRICE_RULE_TTL).await;
        Ok(Arc::new(rule))
    }

    pub async fn get_by_promo_code(
        &self,
        code: &str,
        case_sensitive: bool,
        now_ms: i64,
    ) -> PricingResult<Option<Arc<PriceRule>>> {
        Ok(self.snapshot().await?.find_code(code, case_sensitive, now_ms))
    }

    /// Active rules at `now_ms`, ordered by (priority, rule_id)
    pub async fn list_applicable(&self, now_ms: i64) -> PricingResult<Vec<Arc<PriceRule>>> {
        Ok(self.snapshot().await?.list_applicable(now_ms))
    }

    /// Spawn the background reload task
    ///
    /// Refreshes on every TTL tick until `shutdown` flips to `true`.
    pub fn spawn_reload_task(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.ttl);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh_if_stale().await {
                            tracing::warn!("Background catalog reload failed: {}", err);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Catalog reload task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::memory::MemoryStore;
    use crate::pricing::types::RuleType;

    fn rule(id: &str, priority: i32) -> PriceRule {
        let mut rule = PriceRule::new(id, id, RuleCategory::Discount, RuleType::FixedAmount);
        rule.status = RuleStatus::Active;
        rule.combination.priority = priority;
        rule.code.auto_apply = true;
        rule
    }

    fn coded(id: &str, code: &str, case_sensitive: bool, priority: i32) -> PriceRule {
        let mut rule = rule(id, priority);
        rule.code.auto_apply = false;
        rule.code.requires_code = true;
        rule.code.promo_code = Some(code.to_string());
        rule.code.case_sensitive = case_sensitive;
        rule
    }

    fn catalog(store: Arc<MemoryStore>) -> RuleCatalog {
        RuleCatalog::new(
            store,
            Arc::new(MemoryCache::new()),
            CacheKeys::new("test"),
            DEFAULT_CATALOG_TTL,
            PerformanceMetrics::new(),
        )
    }

    #[test]
    fn test_snapshot_orders_and_excludes_invalid() {
        let mut broken = rule("broken", 1);
        broken.rates.minimum_fare = Some(rust_decimal::Decimal::TEN);
        broken.rates.maximum_fare = Some(rust_decimal::Decimal::ONE);
        let mut deleted = rule("gone", 1);
        deleted.status = RuleStatus::Deleted;

        let snapshot = RuleSnapshot::build(vec![rule("b", 20), rule("a", 20), rule("c", 5), broken, deleted]);

        let ids: Vec<_> = snapshot.rules().iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(snapshot.invalid_rules().len(), 1);
        assert_eq!(snapshot.invalid_rules()[0].0, "broken");
        assert!(snapshot.get("gone").is_none());
        assert_eq!(snapshot.by_category(RuleCategory::Discount).len(), 3);
        assert!(snapshot.by_category(RuleCategory::BasePricing).is_empty());
    }

    #[test]
    fn test_code_lookup_exact_and_folded() {
        let snapshot = RuleSnapshot::build(vec![
            coded("exact", "VIP", true, 10),
            coded("folded", "Save5", false, 10),
        ]);

        assert_eq!(snapshot.find_code("VIP", true, 0).unwrap().rule_id, "exact");
        assert!(snapshot.find_code("vip", true, 0).is_none());
        assert_eq!(snapshot.find_code("SAVE5", false, 0).unwrap().rule_id, "folded");
        assert!(snapshot.find_code("Save5", true, 0).is_none());
    }

    #[test]
    fn test_duplicate_codes_resolve_by_priority_then_recency() {
        let mut older = coded("older", "DUP", false, 10);
        older.updated_at = 100;
        let mut newer = coded("newer", "dup", false, 10);
        newer.updated_at = 200;
        let low = coded("low", "Dup", false, 50);
        let mut paused = coded("paused", "DUP", false, 1);
        paused.status = RuleStatus::Paused;

        let snapshot = RuleSnapshot::build(vec![older, newer, low, paused]);
        assert_eq!(snapshot.find_code("dup", false, 0).unwrap().rule_id, "newer");
    }

    #[test]
    fn test_list_applicable_skips_expired_and_paused() {
        let mut exhausted = rule("exhausted", 1);
        exhausted.limits.max_usage_total = Some(1);
        exhausted.limits.usage_count = 1;
        let mut paused = rule("paused", 1);
        paused.status = RuleStatus::Paused;

        let snapshot = RuleSnapshot::build(vec![rule("ok", 1), exhausted, paused]);
        let ids: Vec<_> = snapshot
            .list_applicable(0)
            .iter()
            .map(|r| r.rule_id.clone())
            .collect();
        assert_eq!(ids, vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn test_first_load_failure_is_catalog_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false).await;
        let catalog = catalog(Arc::clone(&store));

        let result = catalog.load().await;
        assert!(matches!(result, Err(PricingError::CatalogUnavailable(_))));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_last_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.put_rule(rule("a", 1)).await;
        let catalog = catalog(Arc::clone(&store));
        catalog.load().await.unwrap();

        store.set_available(false).await;
        catalog.invalidate(None).await;
        let snapshot = catalog.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_duplicate_codes_skip_expired_and_exhausted() {
        let now = 10_000;
        let mut closed = coded("closed", "SAVE", false, 1);
        closed.scope.ended_at = Some(now - 1_000);
        let mut spent = coded("spent", "SAVE", false, 2);
        spent.limits.max_usage_total = Some(3);
        spent.limits.usage_count = 3;
        let live = coded("live", "SAVE", false, 5);

        let snapshot = RuleSnapshot::build(vec![closed, spent, live]);
        assert_eq!(snapshot.find_code("save", false, now).unwrap().rule_id, "live");
        // Before the window closed the higher-priority rule still wins
        assert_eq!(snapshot.find_code("save", false, now - 2_000).unwrap().rule_id, "closed");
    }

    #[tokio::test]
    async fn test_outage_serves_last_snapshot_without_hammering_store() {
        let store = Arc::new(MemoryStore::new());
        store.put_rule(rule("a", 1)).await;
        let metrics = PerformanceMetrics::new();
        let catalog = RuleCatalog::new(
            Arc::clone(&store) as Arc<dyn RuleStore>,
            Arc::new(MemoryCache::new()),
            CacheKeys::new("test"),
            DEFAULT_CATALOG_TTL,
            metrics.clone(),
        );
        catalog.load().await.unwrap();

        store.set_available(false).await;
        catalog.invalidate(None).await;
        for _ in 0..5 {
            assert_eq!(catalog.snapshot().await.unwrap().len(), 1);
        }
        assert_eq!(metrics.summary().catalog_reload_failures, 1);
    }

    #[tokio::test]
    async fn test_reload_resumes_after_backoff() {
        let store = Arc::new(MemoryStore::new());
        store.put_rule(rule("a", 1)).await;
        let catalog = catalog(Arc::clone(&store));
        catalog.load().await.unwrap();

        store.set_available(false).await;
        catalog.invalidate(None).await;
        assert_eq!(catalog.snapshot().await.unwrap().len(), 1);

        store.set_available(true).await;
        store.put_rule(rule("b", 2)).await;
        // Still backing off: the last snapshot is served
        assert_eq!(catalog.snapshot().await.unwrap().len(), 1);

        catalog.set_retry_not_before(Some(Instant::now()));
        assert_eq!(catalog.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_picks_up_new_rules() {
        let store = Arc::new(MemoryStore::new());
        store.put_rule(rule("a", 1)).await;
        let catalog = catalog(Arc::clone(&store));
        assert_eq!(catalog.snapshot().await.unwrap().len(), 1);

        store.put_rule(rule("b", 2)).await;
        assert_eq!(catalog.snapshot().await.unwrap().len(), 1);

        catalog.invalidate(Some("b")).await;
        assert_eq!(catalog.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_by_id_reads_through_for_deleted_rules() {
        let store = Arc::new(MemoryStore::new());
        let mut retired = rule("retired", 1);
        retired.status = RuleStatus::Deleted;
        store.put_rule(retired).await;
        let catalog = catalog(Arc::clone(&store));

        let found = catalog.get_by_id("retired").await.unwrap();
        assert_eq!(found.status, RuleStatus::Deleted);

        assert!(matches!(
            catalog.get_by_id("missing").await,
            Err(PricingError::RuleNotFound(_))
        ));
    }
}
