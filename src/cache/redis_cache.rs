// Redis cache backend
//
// Every command runs under a short deadline; errors and timeouts are counted,
// flip the health flag and degrade to a miss or a no-op.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;

use super::{jitter, Cache};
use crate::pricing::metrics::PerformanceMetrics;

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 100;

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    timeout: Duration,
    metrics: PerformanceMetrics,
}

impl RedisCache {
    pub async fn connect(
        redis_url: &str,
        timeout: Duration,
        metrics: PerformanceMetrics,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis cache");

        Ok(Self {
            conn,
            timeout,
            metrics,
        })
    }

    /// Run a command under the deadline, mapping any failure to `None`
    async fn run<T, F, Fut>(&self, op: &str, command: F) -> Option<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, command(self.conn.clone())).await {
            Ok(Ok(value)) => {
                self.metrics.record_cache_ok();
                Some(value)
            }
            Ok(Err(e)) => {
                self.metrics.record_cache_error();
                tracing::warn!("Redis {} failed: {}", op, e);
                None
            }
            Err(_) => {
                self.metrics.record_cache_error();
                tracing::warn!("Redis {} timed out after {:?}", op, self.timeout);
                None
            }
        }
    }
}

/// Jittered TTL in whole milliseconds, never zero
fn millis(ttl: Duration) -> u64 {
    jitter(ttl).as_millis().max(1) as u64
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let value = self
            .run("GET", |mut conn| async move {
                conn.get::<_, Option<Vec<u8>>>(key).await
            })
            .await
            .flatten();

        if value.is_some() {
            self.metrics.record_cache_hit();
        } else {
            self.metrics.record_cache_miss();
        }
        value
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        self.run("SET", |mut conn| async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await;
    }

    async fn del(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        self.run("DEL", |mut conn| async move { conn.del::<_, ()>(keys).await })
            .await;
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        let stored = self
            .run("SET NX", |mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async::<_, Option<String>>(&mut conn)
                    .await
            })
            .await
            .flatten();

        stored.is_some()
    }

    async fn scan_delete(&self, pattern: &str) -> u64 {
        self.run("SCAN/DEL", |mut conn| async move {
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;

                if !keys.is_empty() {
                    removed += conn.del::<_, u64>(&keys).await?;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(removed)
        })
        .await
        .unwrap_or(0)
    }

    fn is_healthy(&self) -> bool {
        self.metrics.cache_healthy()
    }
}
