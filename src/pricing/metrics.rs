// Performance Metrics for the pricing engine
//
// Counts quotes, catalog reloads, reservations and cache traffic, tracks
// timing of the hot operations, and exposes backend health so a degraded
// cache or store is visible to operators.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Performance threshold for slow operations (100ms)
const SLOW_OPERATION_THRESHOLD_MS: u64 = 100;

/// Count, cumulative time and slow count of one timed operation
#[derive(Debug, Default)]
struct TimedCounter {
    count: AtomicU64,
    total_us: AtomicU64,
    slow: AtomicU64,
}

impl TimedCounter {
    fn record(&self, label: &str, duration: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        if duration.as_millis() as u64 > SLOW_OPERATION_THRESHOLD_MS {
            self.slow.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Slow {}: {}ms", label, duration.as_millis());
        }
    }

    fn avg_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        let total_us = self.total_us.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            (total_us as f64 / count as f64) / 1000.0
        }
    }
}

#[derive(Debug)]
struct MetricsInner {
    // Cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
    cache_healthy: AtomicBool,

    // Timed operations
    quotes: TimedCounter,
    catalog_reloads: TimedCounter,
    order_updates: TimedCounter,

    // Outcomes
    catalog_reload_failures: AtomicU64,
    reservations: AtomicU64,
    quota_rejections: AtomicU64,
    releases: AtomicU64,
    version_conflicts: AtomicU64,
}

/// Performance metrics shared by every pricing component
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    inner: Arc<MetricsInner>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                cache_errors: AtomicU64::new(0),
                cache_healthy: AtomicBool::new(true),
                quotes: TimedCounter::default(),
                catalog_reloads: TimedCounter::default(),
                order_updates: TimedCounter::default(),
                catalog_reload_failures: AtomicU64::new(0),
                reservations: AtomicU64::new(0),
                quota_rejections: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                version_conflicts: AtomicU64::new(0),
            }),
        }
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed cache operation and flag the cache unhealthy
    pub fn record_cache_error(&self) {
        self.inner.cache_errors.fetch_add(1, Ordering::Relaxed);
        if self.inner.cache_healthy.swap(false, Ordering::Relaxed) {
            tracing::warn!("Cache backend marked unhealthy; operating as pass-through");
        }
    }

    /// Record a successful round trip to the cache backend
    pub fn record_cache_ok(&self) {
        if !self.inner.cache_healthy.swap(true, Ordering::Relaxed) {
            tracing::info!("Cache backend healthy again");
        }
    }

    pub fn cache_healthy(&self) -> bool {
        self.inner.cache_healthy.load(Ordering::Relaxed)
    }

    /// Get cache hit rate (0.0 to 1.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn start_quote(&self) -> OperationTimer {
        OperationTimer::new(OperationType::Quote, self.clone())
    }

    pub fn start_catalog_reload(&self) -> OperationTimer {
        OperationTimer::new(OperationType::CatalogReload, self.clone())
    }

    pub fn start_order_update(&self) -> OperationTimer {
        OperationTimer::new(OperationType::OrderUpdate, self.clone())
    }

    pub fn record_catalog_reload_failure(&self) {
        self.inner
            .catalog_reload_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reservation(&self) {
        self.inner.reservations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_rejection(&self) {
        self.inner.quota_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self, count: u64) {
        self.inner.releases.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_version_conflict(&self) {
        self.inner.version_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, operation: OperationType, duration: Duration) {
        match operation {
            OperationType::Quote => self.inner.quotes.record("quote", duration),
            OperationType::CatalogReload => {
                self.inner.catalog_reloads.record("catalog reload", duration)
            }
            OperationType::OrderUpdate => self.inner.order_updates.record("order update", duration),
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let inner = &self.inner;
        MetricsSummary {
            cache_hit_rate: self.cache_hit_rate(),
            cache_hits: inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: inner.cache_misses.load(Ordering::Relaxed),
            cache_errors: inner.cache_errors.load(Ordering::Relaxed),
            cache_healthy: self.cache_healthy(),
            quotes: inner.quotes.count.load(Ordering::Relaxed),
            avg_quote_time_ms: inner.quotes.avg_ms(),
            slow_quotes: inner.quotes.slow.load(Ordering::Relaxed),
            catalog_reloads: inner.catalog_reloads.count.load(Ordering::Relaxed),
            catalog_reload_failures: inner.catalog_reload_failures.load(Ordering::Relaxed),
            order_updates: inner.order_updates.count.load(Ordering::Relaxed),
            avg_order_update_time_ms: inner.order_updates.avg_ms(),
            reservations: inner.reservations.load(Ordering::Relaxed),
            quota_rejections: inner.quota_rejections.load(Ordering::Relaxed),
            releases: inner.releases.load(Ordering::Relaxed),
            version_conflicts: inner.version_conflicts.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        tracing::info!(
            "Pricing metrics:\n\
             Cache: {:.1}% hit rate ({} hits, {} misses, {} errors, healthy={})\n\
             Quotes: {} computed, avg {:.2}ms, {} slow\n\
             Catalog: {} reloads, {} failures\n\
             Orders: {} updates, avg {:.2}ms, {} version conflicts\n\
             Usage: {} reservations, {} quota rejections, {} releases",
            summary.cache_hit_rate * 100.0,
            summary.cache_hits,
            summary.cache_misses,
            summary.cache_errors,
            summary.cache_healthy,
            summary.quotes,
            summary.avg_quote_time_ms,
            summary.slow_quotes,
            summary.catalog_reloads,
            summary.catalog_reload_failures,
            summary.order_updates,
            summary.avg_order_update_time_ms,
            summary.version_conflicts,
            summary.reservations,
            summary.quota_rejections,
            summary.releases,
        );
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum OperationType {
    Quote,
    CatalogReload,
    OrderUpdate,
}

/// Records the elapsed time of an operation when dropped
pub struct OperationTimer {
    start: Instant,
    operation_type: OperationType,
    metrics: PerformanceMetrics,
}

impl OperationTimer {
    fn new(operation_type: OperationType, metrics: PerformanceMetrics) -> Self {
        Self {
            start: Instant::now(),
            operation_type,
            metrics,
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.metrics
            .record(self.operation_type, self.start.elapsed());
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub cache_hit_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub cache_healthy: bool,
    pub quotes: u64,
    pub avg_quote_time_ms: f64,
    pub slow_quotes: u64,
    pub catalog_reloads: u64,
    pub catalog_reload_failures: u64,
    pub order_updates: u64,
    pub avg_order_update_time_ms: f64,
    pub reservations: u64,
    pub quota_rejections: u64,
    pub releases: u64,
    pub version_conflicts: u64,
}
