//! Redis-backed [`DurableStore`]
//!
//! Queues are Redis lists, delayed retries and dead letters are sorted sets
//! scored by due/expiry time in epoch millis, and locks are `SET NX PX`
//! keys released through a compare-and-delete script. Arrivals are
//! announced on a pub/sub channel so every broker sharing the Redis
//! instance learns about new work.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use super::{ArrivalStream, DurableStore, LockToken};
use crate::error::{BrokerError, BrokerResult};

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, member in ipairs(due) do
    local sep = string.find(member, '|', 1, true)
    redis.call('RPUSH', KEYS[2], string.sub(member, sep + 1))
end
if #due > 0 then
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
return #due
"#;

const REMOVE_HEAD_SCRIPT: &str = r#"
local len = redis.call('LLEN', KEYS[1])
local n = math.min(len, tonumber(ARGV[1]))
if n > 0 then
    redis.call('LTRIM', KEYS[1], n, -1)
end
return n
"#;

/// Redis store configuration
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of connections in the pool
    pub pool_size: usize,
    /// Pub/sub channel announcing queue arrivals
    pub arrivals_channel: String,
    /// How often a blocked `try_lock` retries
    pub lock_retry_interval: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 16,
            arrivals_channel: "mpipe:arrivals".to_string(),
            lock_retry_interval: Duration::from_millis(50),
        }
    }
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the pool size
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the arrivals channel
    pub fn with_arrivals_channel(mut self, channel: impl Into<String>) -> Self {
        self.arrivals_channel = channel.into();
        self
    }
}

/// Redis durable store
pub struct RedisStore {
    pool: deadpool_redis::Pool,
    config: RedisStoreConfig,
    release_lock: redis::Script,
    promote_due: redis::Script,
    remove_head: redis::Script,
    shutdown: AtomicBool,
}

impl RedisStore {
    /// Connect with default configuration
    pub async fn new(url: impl Into<String>) -> BrokerResult<Self> {
        Self::with_config(RedisStoreConfig::new(url)).await
    }

    /// Connect with custom configuration
    pub async fn with_config(config: RedisStoreConfig) -> BrokerResult<Self> {
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        redis_config.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| BrokerError::Configuration(format!("redis pool: {}", e)))?;

        // Test connection
        let mut conn = pool.get().await.map_err(BrokerError::store)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| BrokerError::store(format!("PING failed: {}", e)))?;

        debug!(url = %config.url, "Redis store connected");

        Ok(Self {
            pool,
            config,
            release_lock: redis::Script::new(RELEASE_LOCK_SCRIPT),
            promote_due: redis::Script::new(PROMOTE_DUE_SCRIPT),
            remove_head: redis::Script::new(REMOVE_HEAD_SCRIPT),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Stop serving; later operations fail with [`BrokerError::StoreShutdown`]
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pool.close();
    }

    async fn get_connection(&self) -> BrokerResult<deadpool_redis::Connection> {
        if self.is_shutdown() {
            return Err(BrokerError::StoreShutdown);
        }
        self.pool.get().await.map_err(BrokerError::store)
    }

    async fn announce(&self, conn: &mut deadpool_redis::Connection, queue: &str) {
        if let Err(e) = conn
            .publish::<_, _, ()>(&self.config.arrivals_channel, queue)
            .await
        {
            error!(queue = %queue, error = %e, "Failed to announce arrival");
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Milliseconds in `span`, saturating at `i64::MAX`
fn span_millis(span: Duration) -> i64 {
    i64::try_from(span.as_millis()).unwrap_or(i64::MAX)
}

fn delayed_member(payload: &str) -> String {
    format!("{}|{}", uuid::Uuid::new_v4().simple(), payload)
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn offer(&self, queue: &str, payload: String) -> BrokerResult<()> {
        let mut conn = self.get_connection().await?;
        conn.rpush::<_, _, ()>(queue, payload).await?;
        self.announce(&mut conn, queue).await;
        Ok(())
    }

    async fn peek(&self, queue: &str) -> BrokerResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        Ok(conn.lindex(queue, 0).await?)
    }

    async fn peek_batch(&self, queue: &str, max: usize) -> BrokerResult<Vec<String>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        Ok(conn.lrange(queue, 0, max as isize - 1).await?)
    }

    async fn poll(&self, queue: &str) -> BrokerResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        Ok(conn.lpop(queue, None).await?)
    }

    async fn remove_head(&self, queue: &str, count: usize) -> BrokerResult<usize> {
        let mut conn = self.get_connection().await?;
        let removed: usize = self
            .remove_head
            .key(queue)
            .arg(count)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn size(&self, queue: &str) -> BrokerResult<usize> {
        let mut conn = self.get_connection().await?;
        Ok(conn.llen(queue).await?)
    }

    async fn offer_delayed(
        &self,
        delayed: &str,
        payload: String,
        delay: Duration,
    ) -> BrokerResult<()> {
        let mut conn = self.get_connection().await?;
        let due = now_millis().saturating_add(span_millis(delay));
        conn.zadd::<_, _, _, ()>(delayed, delayed_member(&payload), due)
            .await?;
        Ok(())
    }

    async fn promote_due(&self, delayed: &str, queue: &str) -> BrokerResult<usize> {
        let mut conn = self.get_connection().await?;
        let moved: usize = self
            .promote_due
            .key(delayed)
            .key(queue)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        if moved > 0 {
            debug!(delayed = %delayed, queue = %queue, moved, "Promoted due entries");
            self.announce(&mut conn, queue).await;
        }
        Ok(moved)
    }

    async fn delayed_size(&self, delayed: &str) -> BrokerResult<usize> {
        let mut conn = self.get_connection().await?;
        Ok(conn.zcard(delayed).await?)
    }

    async fn add_expiring(&self, key: &str, payload: String, ttl: Duration) -> BrokerResult<()> {
        let mut conn = self.get_connection().await?;
        let now = now_millis();
        let expires_at = now.saturating_add(span_millis(ttl));
        redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(now)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(expires_at)
            .arg(payload)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(span_millis(ttl))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_expiring(&self, key: &str, limit: usize) -> BrokerResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let records: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(format!("({}", now_millis()))
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(records)
    }

    async fn count_expiring(&self, key: &str) -> BrokerResult<usize> {
        let mut conn = self.get_connection().await?;
        let count: usize = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({}", now_millis()))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn remove_expiring(&self, key: &str, payload: &str) -> BrokerResult<bool> {
        let mut conn = self.get_connection().await?;
        let removed: usize = conn.zrem(key, payload).await?;
        Ok(removed > 0)
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        let mut conn = self.get_connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease: Duration,
    ) -> BrokerResult<Option<LockToken>> {
        let deadline = Instant::now() + wait;
        let token = LockToken::generate();

        loop {
            let mut conn = self.get_connection().await?;
            let acquired: Option<String> = redis::cmd("SET")
                .arg(name)
                .arg(token.as_str())
                .arg("NX")
                .arg("PX")
                .arg(lease.as_millis().max(1) as u64)
                .query_async(&mut conn)
                .await?;
            drop(conn);

            if acquired.is_some() {
                return Ok(Some(token));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let pause = self.config.lock_retry_interval.min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    async fn unlock(&self, name: &str, token: &LockToken) -> BrokerResult<bool> {
        let mut conn = self.get_connection().await?;
        let deleted: usize = self
            .release_lock
            .key(name)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn keys(&self, pattern: &str) -> BrokerResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn arrivals(&self) -> BrokerResult<ArrivalStream> {
        if self.is_shutdown() {
            return Err(BrokerError::StoreShutdown);
        }

        // Pub/sub needs a dedicated connection
        let client = redis::Client::open(self.config.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.config.arrivals_channel).await?;

        debug!(channel = %self.config.arrivals_channel, "Subscribed to arrivals");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(queue) => Some(queue),
                Err(e) => {
                    error!(error = %e, "Failed to read arrival payload");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
