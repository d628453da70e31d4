// Cache façade
//
// Byte-oriented key/value cache used read-through for price rules and hot
// orders. Backends never surface errors: a failed or slow operation reads as a
// miss and writes become no-ops, with the failure reported through metrics.

pub mod memory;
pub mod redis_cache;

pub use self::memory::{MemoryCache, NoopCache};
pub use self::redis_cache::RedisCache;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// TTL for cached orders
pub const ORDER_TTL: Duration = Duration::from_secs(30 * 60);

/// TTL for cached price rules
pub const PRICE_RULE_TTL: Duration = Duration::from_secs(10 * 60);

/// Fraction of a TTL by which entries are randomly shortened or extended
const TTL_JITTER: f64 = 0.10;

/// Key/value cache
///
/// Every write applies [`jitter`] to the TTL it is given.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration);

    async fn del(&self, keys: &[String]);

    /// Store only when the key is absent; returns whether the value was stored
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> bool;

    /// Delete every key matching a `*` glob; returns the number removed
    async fn scan_delete(&self, pattern: &str) -> u64;

    fn is_healthy(&self) -> bool;
}

/// Key layout under a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    namespace: String,
}

impl CacheKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn order(&self, order_id: &str) -> String {
        format!("{}:order:{}", self.namespace, order_id)
    }

    pub fn price_rule(&self, rule_id: &str) -> String {
        format!("{}:pricerule:{}", self.namespace, rule_id)
    }

    pub fn price_rule_pattern(&self) -> String {
        format!("{}:pricerule:*", self.namespace)
    }

    /// Driver location key; the TTL is chosen by whoever writes it
    pub fn driver_location(&self, user_id: &str) -> String {
        format!("{}:driver_location:{}", self.namespace, user_id)
    }
}

/// `ttl` shifted by a random amount within ±10%
pub fn jitter(ttl: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range((1.0 - TTL_JITTER)..=(1.0 + TTL_JITTER));
    ttl.mul_f64(factor)
}

/// Read and decode a JSON entry; undecodable entries are dropped and read as a miss
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let bytes = cache.get(key).await?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Dropping undecodable cache entry {}: {}", key, e);
            cache.del(&[key.to_string()]).await;
            None
        }
    }
}

/// Fill a read-through entry without overwriting a concurrent fill
pub async fn fill_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            if !cache.set_if_absent(key, &bytes, ttl).await {
                tracing::debug!("Cache entry {} already filled", key);
            }
        }
        Err(e) => tracing::warn!("Could not encode cache entry {}: {}", key, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = CacheKeys::new("ride");
        assert_eq!(keys.order("o-1"), "ride:order:o-1");
        assert_eq!(keys.price_rule("r-1"), "ride:pricerule:r-1");
        assert_eq!(keys.price_rule_pattern(), "ride:pricerule:*");
        assert_eq!(keys.driver_location("u-1"), "ride:driver_location:u-1");
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let ttl = Duration::from_secs(600);
        for _ in 0..100 {
            let jittered = jitter(ttl);
            assert!(jittered >= Duration::from_secs(539));
            assert!(jittered <= Duration::from_secs(661));
        }
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = MemoryCache::new();
        fill_json(&cache, "k", &vec![1, 2, 3], PRICE_RULE_TTL).await;
        fill_json(&cache, "k", &vec![9], PRICE_RULE_TTL).await;

        let value: Option<Vec<i32>> = get_json(&cache, "k").await;
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_undecodable_entry_reads_as_miss() {
        let cache = MemoryCache::new();
        cache.set("k", b"not json", PRICE_RULE_TTL).await;

        let value: Option<Vec<i32>> = get_json(&cache, "k").await;
        assert!(value.is_none());
        assert!(cache.get("k").await.is_none());
    }
}
