// Runtime configuration
//
// Settings are read from the process environment (optionally seeded from a .env
// file) with typed defaults for everything except the database URL.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

/// Which persistence backend the worker runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "pg" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub storage_backend: StorageBackend,
    /// Prefix for every cache key, e.g. `ride` in `ride:order:{id}`
    pub cache_namespace: String,
    pub catalog_ttl: Duration,
    pub quote_ttl: Duration,
    pub reservation_grace: Duration,
    pub sweep_interval: Duration,
    pub db_timeout: Duration,
    pub db_max_connections: u32,
    pub cache_timeout: Duration,
    pub platform_fee: Decimal,
    pub default_currency: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            storage_backend: StorageBackend::Memory,
            cache_namespace: "ride".to_string(),
            catalog_ttl: Duration::from_secs(60),
            quote_ttl: Duration::from_secs(15 * 60),
            reservation_grace: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            db_timeout: Duration::from_secs(5),
            db_max_connections: 10,
            cache_timeout: Duration::from_millis(200),
            platform_fee: Decimal::ZERO,
            default_currency: "USD".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the environment
    ///
    /// Calls `dotenv` first so a local `.env` file can provide values. When
    /// `STORAGE_BACKEND` is unset the backend is Postgres if `DATABASE_URL` is
    /// present and memory otherwise.
    pub fn from_env() -> Result<Self, String> {
        dotenv::dotenv().ok();

        let defaults = Settings::default();
        let database_url = std::env::var("DATABASE_URL").ok();

        let storage_backend = match std::env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) if database_url.is_some() => StorageBackend::Postgres,
            Err(_) => StorageBackend::Memory,
        };

        if storage_backend == StorageBackend::Postgres && database_url.is_none() {
            return Err("DATABASE_URL must be set for the postgres backend".to_string());
        }

        Ok(Self {
            database_url,
            redis_url: std::env::var("REDIS_URL").ok(),
            storage_backend,
            cache_namespace: std::env::var("CACHE_NAMESPACE")
                .unwrap_or(defaults.cache_namespace),
            catalog_ttl: env_secs("CATALOG_TTL_SECS", defaults.catalog_ttl)?,
            quote_ttl: env_secs("QUOTE_TTL_SECS", defaults.quote_ttl)?,
            reservation_grace: env_secs("RESERVATION_GRACE_SECS", defaults.reservation_grace)?,
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            db_timeout: env_secs("DB_TIMEOUT_SECS", defaults.db_timeout)?,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            cache_timeout: Duration::from_millis(env_parse(
                "CACHE_TIMEOUT_MS",
                defaults.cache_timeout.as_millis() as u64,
            )?),
            platform_fee: env_parse("PLATFORM_FEE", defaults.platform_fee)?,
            default_currency: std::env::var("DEFAULT_CURRENCY")
                .unwrap_or(defaults.default_currency),
        })
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, String> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
