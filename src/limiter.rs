use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use redis::aio::ConnectionManager;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("Counter store operation failed: {0}")]
    StoreError(#[from] redis::RedisError),
}

/// Sliding-window attempt counters keyed by an opaque string.
///
/// `allow` records the current attempt, evicts entries that have fallen out
/// of the window, and compares the remaining count against the limit, all as
/// one atomic step against the backing store. The attempt is recorded even
/// when the answer is false, so a flood keeps consuming window capacity
/// instead of racing the read. A limit of zero therefore always denies.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> Result<bool, LimiterError>;
    async fn reset(&self, key: &str) -> Result<(), LimiterError>;
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Default)]
struct Bucket {
    entries: Vec<i64>,
    expires_at: i64,
}

/// In-memory counter store for local workmode and tests. One mutex guards
/// the whole key map, which serialises concurrent `allow` calls on the same
/// key.
#[derive(Debug, Default)]
pub struct MemBucketStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemBucketStore {
    pub fn new() -> MemBucketStore {
        MemBucketStore::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bucket>> {
        match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl BucketStore for MemBucketStore {
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> Result<bool, LimiterError> {
        let now = now_millis();
        let window_ms = window.as_millis() as i64;

        let mut buckets = self.lock();

        // Stand-in for the external store's key TTL: drop buckets whose
        // retention deadline has passed.
        buckets.retain(|_, bucket| bucket.expires_at > now);

        let bucket = buckets.entry(key.to_owned()).or_default();
        bucket.entries.push(now);
        bucket.entries.retain(|&stamp| stamp > now - window_ms);
        bucket.expires_at = now + 2 * window_ms;

        Ok(bucket.entries.len() as u64 <= u64::from(limit))
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Redis-backed counter store shared by all gateway replicas.
///
/// Each key is a sorted set of attempt timestamps scored in epoch
/// milliseconds; the member carries a random suffix so concurrent attempts
/// landing on the same millisecond stay distinct. The add/evict/count/expire
/// sequence runs inside a MULTI/EXEC pipeline.
pub struct RedisBucketStore {
    conn: ConnectionManager,
}

impl RedisBucketStore {
    pub async fn new(client: redis::Client) -> Result<RedisBucketStore, LimiterError> {
        let mut conn = ConnectionManager::new(client).await?;
        // Verify the connection up front rather than on the first attempt.
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(RedisBucketStore { conn })
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> Result<bool, LimiterError> {
        let now = now_millis();
        let window_ms = window.as_millis() as i64;
        let member = format!("{}:{}", now, rand::rngs::OsRng.next_u64());

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(key, member.as_str(), now)
            .ignore()
            .zrembyscore(key, 0i64, now - window_ms)
            .ignore()
            .zcard(key)
            .pexpire(key, 2 * window_ms)
            .ignore();

        let (count,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(count <= i64::from(limit))
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}
