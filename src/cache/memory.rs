// In-process cache backends
//
// `MemoryCache` honours TTLs and is used by tests and the memory storage
// backend; `NoopCache` is the pass-through used when no cache is configured.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{jitter, Cache};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Turn a `*` glob into an anchored regex
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*"))).ok()
}

/// TTL-honouring in-process cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .get(key)
            .map_or(false, |entry| entry.is_live(now))
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + jitter(ttl),
            },
        );
    }

    async fn del(&self, keys: &[String]) {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).map_or(false, |entry| entry.is_live(now)) {
            return false;
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: now + jitter(ttl),
            },
        );
        true
    }

    async fn scan_delete(&self, pattern: &str) -> u64 {
        let Some(matcher) = glob_to_regex(pattern) else {
            tracing::warn!("Unusable cache key pattern {}", pattern);
            return 0;
        };
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        (before - entries.len()) as u64
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Pass-through cache: every read misses, every write is dropped
///
/// Reports unhealthy so running without a cache stays visible.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) {}

    async fn del(&self, _keys: &[String]) {}

    async fn set_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> bool {
        false
    }

    async fn scan_delete(&self, _pattern: &str) -> u64 {
        0
    }

    fn is_healthy(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_get_del() {
        let cache = MemoryCache::new();
        cache.set("a", b"1", TTL).await;
        assert_eq!(cache.get("a").await, Some(b"1".to_vec()));

        cache.del(&["a".to_string()]).await;
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_set_if_absent_keeps_first_value() {
        let cache = MemoryCache::new();
        assert!(cache.set_if_absent("a", b"first", TTL).await);
        assert!(!cache.set_if_absent("a", b"second", TTL).await);
        assert_eq!(cache.get("a").await, Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_miss() {
        let cache = MemoryCache::new();
        cache.set("a", b"1", Duration::from_millis(5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.get("a").await.is_none());
        assert!(cache.set_if_absent("a", b"2", TTL).await);
    }

    #[tokio::test]
    async fn test_scan_delete_matches_glob() {
        let cache = MemoryCache::new();
        cache.set("ride:pricerule:a", b"1", TTL).await;
        cache.set("ride:pricerule:b", b"1", TTL).await;
        cache.set("ride:order:a", b"1", TTL).await;

        assert_eq!(cache.scan_delete("ride:pricerule:*").await, 2);
        assert_eq!(cache.len().await, 1);
        assert!(cache.contains("ride:order:a").await);
    }

    async fn remaining(cache: &MemoryCache, key: &str) -> Duration {
        let entries = cache.entries.lock().await;
        entries[key].expires_at.saturating_duration_since(Instant::now())
    }

    #[tokio::test]
    async fn test_every_write_jitters_its_ttl() {
        let ttl = Duration::from_secs(600);
        let cache = MemoryCache::new();
        for i in 0..50 {
            let (set_key, fill_key, json_key) =
                (format!("s{}", i), format!("f{}", i), format!("j{}", i));
            cache.set(&set_key, b"1", ttl).await;
            cache.set_if_absent(&fill_key, b"1", ttl).await;
            crate::cache::fill_json(&cache, &json_key, &i, ttl).await;

            for key in [&set_key, &fill_key, &json_key] {
                let left = remaining(&cache, key).await;
                assert!(left >= Duration::from_secs(539), "{} expires too early", key);
                assert!(left <= Duration::from_secs(660), "{} expires too late", key);
            }
        }
    }

    #[tokio::test]
    async fn test_noop_cache_is_pass_through() {
        let cache = NoopCache;
        cache.set("a", b"1", TTL).await;
        assert!(cache.get("a").await.is_none());
        assert!(!cache.set_if_absent("a", b"1", TTL).await);
        assert!(!cache.is_healthy());
    }
}
