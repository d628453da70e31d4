use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ride_pricing::cache::{Cache, CacheKeys, NoopCache, RedisCache};
use ride_pricing::config::{Settings, StorageBackend};
use ride_pricing::db;
use ride_pricing::memory::MemoryStore;
use ride_pricing::orders::{OrderFareBinder, OrderStore, PgOrderStore};
use ride_pricing::pricing::{
    AuditLogger, PerformanceMetrics, PgRuleStore, PgUsageStore, PricingEngine, RuleCatalog,
    RuleStore, UsageAccountant, UsageStore,
};

const QUOTE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

struct Stores {
    rules: Arc<dyn RuleStore>,
    usage: Arc<dyn UsageStore>,
    orders: Arc<dyn OrderStore>,
    audit: Option<AuditLogger>,
}

async fn open_stores(settings: &Settings) -> Result<Stores, Box<dyn std::error::Error>> {
    match settings.storage_backend {
        StorageBackend::Postgres => {
            let database_url = settings
                .database_url
                .as_deref()
                .ok_or("DATABASE_URL must be set for the postgres backend")?;

            tracing::info!("Connecting to database...");
            let pool =
                db::create_pool(database_url, settings.db_max_connections, settings.db_timeout)
                    .await?;

            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("Migrations completed successfully");

            Ok(Stores {
                rules: Arc::new(PgRuleStore::new(pool.clone(), settings.db_timeout)),
                usage: Arc::new(PgUsageStore::new(pool.clone(), settings.db_timeout)),
                orders: Arc::new(PgOrderStore::new(pool.clone(), settings.db_timeout)),
                audit: Some(AuditLogger::new(pool)),
            })
        }
        StorageBackend::Memory => {
            tracing::warn!("Running with the in-memory backend; state is lost on exit");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                rules: store.clone(),
                usage: store.clone(),
                orders: store,
                audit: None,
            })
        }
    }
}

async fn open_cache(settings: &Settings, metrics: &PerformanceMetrics) -> Arc<dyn Cache> {
    let Some(redis_url) = settings.redis_url.as_deref() else {
        tracing::info!("REDIS_URL not set; running without a cache");
        return Arc::new(NoopCache);
    };

    match RedisCache::connect(redis_url, settings.cache_timeout, metrics.clone()).await {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            tracing::warn!("Redis unavailable, continuing without a cache: {}", err);
            Arc::new(NoopCache)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    tracing::info!("Ride pricing - Starting...");

    let settings = Settings::from_env()?;
    let metrics = PerformanceMetrics::new();
    let stores = open_stores(&settings).await?;
    let cache = open_cache(&settings, &metrics).await;
    let keys = CacheKeys::new(settings.cache_namespace.clone());

    let catalog = Arc::new(RuleCatalog::new(
        stores.rules.clone(),
        cache.clone(),
        keys.clone(),
        settings.catalog_ttl,
        metrics.clone(),
    ));
    let usage = Arc::new(UsageAccountant::new(
        stores.usage,
        settings.reservation_grace,
        metrics.clone(),
    ));

    let mut engine = PricingEngine::new(
        catalog.clone(),
        usage.clone(),
        stores.rules,
        metrics.clone(),
        settings.platform_fee,
        settings.quote_ttl,
    );
    if let Some(audit) = stores.audit {
        engine = engine.with_audit(audit);
    }
    let engine = Arc::new(engine);

    // An empty or unreachable catalog is not fatal; the reload task keeps trying
    if let Err(err) = engine.warm_catalog().await {
        tracing::warn!("Catalog warm-up failed: {}", err);
    }

    let binder = Arc::new(OrderFareBinder::new(
        engine.clone(),
        stores.orders,
        cache,
        keys,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        catalog.spawn_reload_task(shutdown_rx.clone()),
        usage.spawn_sweeper(settings.sweep_interval, shutdown_rx.clone()),
        binder.spawn_quote_purger(QUOTE_PURGE_INTERVAL, shutdown_rx),
    ];

    tracing::info!("Ride pricing is running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    shutdown_tx.send(true)?;
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!("Background task ended abnormally: {}", err);
        }
    }

    metrics.log_summary();
    Ok(())
}
