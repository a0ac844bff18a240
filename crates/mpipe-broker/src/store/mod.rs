//! Durable queue and lock store contract
//!
//! The store is the only cross-process source of truth: queue contents,
//! delayed retries, dead letters and the distributed locks that serialize
//! access to a pipe all live behind [`DurableStore`]. Payloads are opaque
//! strings; encoding is the pipe codec's job.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

use crate::error::BrokerResult;

mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Stream of queue keys that just received a message
pub type ArrivalStream = Pin<Box<dyn Stream<Item = String> + Send + 'static>>;

/// Proof of lock ownership, required to release the lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Create a fresh random token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Durable queue store with distributed locks
///
/// Implementations must be safe to share across tasks and across broker
/// processes pointed at the same backend.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ---- FIFO queues ----------------------------------------------------

    /// Append to the tail of a queue
    async fn offer(&self, queue: &str, payload: String) -> BrokerResult<()>;

    /// Read the head without removing it
    async fn peek(&self, queue: &str) -> BrokerResult<Option<String>>;

    /// Read up to `max` entries from the head without removing them
    async fn peek_batch(&self, queue: &str, max: usize) -> BrokerResult<Vec<String>>;

    /// Remove and return the head
    async fn poll(&self, queue: &str) -> BrokerResult<Option<String>>;

    /// Remove up to `count` entries from the head, returning how many went
    async fn remove_head(&self, queue: &str, count: usize) -> BrokerResult<usize>;

    /// Number of entries in a queue
    async fn size(&self, queue: &str) -> BrokerResult<usize>;

    // ---- delayed queues -------------------------------------------------

    /// Park a payload until `delay` has elapsed
    async fn offer_delayed(&self, delayed: &str, payload: String, delay: Duration)
    -> BrokerResult<()>;

    /// Atomically move every due entry of `delayed` to the tail of `queue`
    async fn promote_due(&self, delayed: &str, queue: &str) -> BrokerResult<usize>;

    /// Number of entries still parked in a delayed queue
    async fn delayed_size(&self, delayed: &str) -> BrokerResult<usize>;

    // ---- expiring records -----------------------------------------------

    /// Store a record that disappears after `ttl`
    async fn add_expiring(&self, key: &str, payload: String, ttl: Duration) -> BrokerResult<()>;

    /// Live records, oldest first, at most `limit`
    async fn list_expiring(&self, key: &str, limit: usize) -> BrokerResult<Vec<String>>;

    /// Number of live records
    async fn count_expiring(&self, key: &str) -> BrokerResult<usize>;

    /// Remove one record by exact payload
    async fn remove_expiring(&self, key: &str, payload: &str) -> BrokerResult<bool>;

    /// Delete a key of any kind
    async fn delete(&self, key: &str) -> BrokerResult<()>;

    // ---- distributed locks ----------------------------------------------

    /// Try to acquire `name`, waiting at most `wait`; the lock lapses by
    /// itself after `lease` unless released earlier
    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease: Duration,
    ) -> BrokerResult<Option<LockToken>>;

    /// Release a lock held under `token`; `false` if it was no longer ours
    async fn unlock(&self, name: &str, token: &LockToken) -> BrokerResult<bool>;

    // ---- discovery --------------------------------------------------------

    /// Keys matching a glob pattern (`*` wildcard)
    async fn keys(&self, pattern: &str) -> BrokerResult<Vec<String>>;

    /// Notifications of queue keys receiving messages
    async fn arrivals(&self) -> BrokerResult<ArrivalStream>;

    /// Whether the store has been shut down
    fn is_shutdown(&self) -> bool;
}

/// Glob match supporting `*` only, as used for key enumeration
pub(crate) fn glob_matches(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (idx, part) in parts.iter().enumerate() {
        if idx == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if idx == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
