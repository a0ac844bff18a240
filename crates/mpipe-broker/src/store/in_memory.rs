//! Process-local [`DurableStore`]
//!
//! Backs single-node deployments and tests. Lock waits, lease expiry,
//! delayed promotion and record TTLs behave like the Redis backend, and
//! failures can be injected to exercise the broker's degraded paths.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{ArrivalStream, DurableStore, LockToken, glob_matches};
use crate::error::{BrokerError, BrokerResult};

const ARRIVAL_CHANNEL_SIZE: usize = 1024;

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<String>>,
    delayed: HashMap<String, Vec<DelayedEntry>>,
    expiring: HashMap<String, Vec<(Instant, String)>>,
    locks: HashMap<String, HeldLock>,
    delayed_seq: u64,
}

struct DelayedEntry {
    due: Instant,
    seq: u64,
    payload: String,
}

struct HeldLock {
    token: LockToken,
    expires_at: Instant,
}

/// In-memory durable store
pub struct InMemoryStore {
    state: Mutex<State>,
    lock_released: Notify,
    arrivals: broadcast::Sender<String>,
    shutdown: AtomicBool,
    failing: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (arrivals, _) = broadcast::channel(ARRIVAL_CHANNEL_SIZE);
        Self {
            state: Mutex::new(State::default()),
            lock_released: Notify::new(),
            arrivals,
            shutdown: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    /// Simulate backend loss; every later operation fails
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.lock_released.notify_waiters();
    }

    /// Make every operation fail with a store error until switched off
    pub fn inject_failures(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether a lock is currently held (and not lapsed)
    pub fn is_locked(&self, name: &str) -> bool {
        let state = self.lock_state();
        state
            .locks
            .get(name)
            .is_some_and(|held| held.expires_at > Instant::now())
    }

    fn check(&self) -> BrokerResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(BrokerError::StoreShutdown);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::store("injected store failure"));
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the guard cannot leave State half-updated,
        // every mutation is a single collection call.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `start + span`, clamped to a far horizon instead of overflowing
fn after(start: Instant, span: Duration) -> Instant {
    const HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
    start + span.min(HORIZON)
}

fn purge_expired(records: &mut Vec<(Instant, String)>, now: Instant) {
    records.retain(|(expires_at, _)| *expires_at > now);
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn offer(&self, queue: &str, payload: String) -> BrokerResult<()> {
        self.check()?;
        self.lock_state()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        // No receivers is fine
        let _ = self.arrivals.send(queue.to_string());
        Ok(())
    }

    async fn peek(&self, queue: &str) -> BrokerResult<Option<String>> {
        self.check()?;
        Ok(self
            .lock_state()
            .queues
            .get(queue)
            .and_then(|q| q.front().cloned()))
    }

    async fn peek_batch(&self, queue: &str, max: usize) -> BrokerResult<Vec<String>> {
        self.check()?;
        Ok(self
            .lock_state()
            .queues
            .get(queue)
            .map(|q| q.iter().take(max).cloned().collect())
            .unwrap_or_default())
    }

    async fn poll(&self, queue: &str) -> BrokerResult<Option<String>> {
        self.check()?;
        Ok(self
            .lock_state()
            .queues
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }

    async fn remove_head(&self, queue: &str, count: usize) -> BrokerResult<usize> {
        self.check()?;
        let mut state = self.lock_state();
        let Some(q) = state.queues.get_mut(queue) else {
            return Ok(0);
        };
        let n = count.min(q.len());
        q.drain(..n);
        Ok(n)
    }

    async fn size(&self, queue: &str) -> BrokerResult<usize> {
        self.check()?;
        Ok(self.lock_state().queues.get(queue).map_or(0, |q| q.len()))
    }

    async fn offer_delayed(
        &self,
        delayed: &str,
        payload: String,
        delay: Duration,
    ) -> BrokerResult<()> {
        self.check()?;
        let mut state = self.lock_state();
        state.delayed_seq += 1;
        let seq = state.delayed_seq;
        state
            .delayed
            .entry(delayed.to_string())
            .or_default()
            .push(DelayedEntry {
                due: after(Instant::now(), delay),
                seq,
                payload,
            });
        Ok(())
    }

    async fn promote_due(&self, delayed: &str, queue: &str) -> BrokerResult<usize> {
        self.check()?;
        let now = Instant::now();
        let mut due = {
            let mut state = self.lock_state();
            let Some(entries) = state.delayed.get_mut(delayed) else {
                return Ok(0);
            };
            let (ready, waiting): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|entry| entry.due <= now);
            *entries = waiting;
            ready
        };

        if due.is_empty() {
            return Ok(0);
        }

        due.sort_by_key(|entry| (entry.due, entry.seq));
        let moved = due.len();
        {
            let mut state = self.lock_state();
            let target = state.queues.entry(queue.to_string()).or_default();
            target.extend(due.into_iter().map(|entry| entry.payload));
        }
        debug!(delayed = %delayed, queue = %queue, moved, "Promoted due entries");
        let _ = self.arrivals.send(queue.to_string());
        Ok(moved)
    }

    async fn delayed_size(&self, delayed: &str) -> BrokerResult<usize> {
        self.check()?;
        Ok(self.lock_state().delayed.get(delayed).map_or(0, |d| d.len()))
    }

    async fn add_expiring(&self, key: &str, payload: String, ttl: Duration) -> BrokerResult<()> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock_state();
        let records = state.expiring.entry(key.to_string()).or_default();
        purge_expired(records, now);
        records.push((after(now, ttl), payload));
        Ok(())
    }

    async fn list_expiring(&self, key: &str, limit: usize) -> BrokerResult<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock_state();
        let Some(records) = state.expiring.get_mut(key) else {
            return Ok(Vec::new());
        };
        purge_expired(records, now);
        Ok(records
            .iter()
            .take(limit)
            .map(|(_, payload)| payload.clone())
            .collect())
    }

    async fn count_expiring(&self, key: &str) -> BrokerResult<usize> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock_state();
        Ok(state.expiring.get_mut(key).map_or(0, |records| {
            purge_expired(records, now);
            records.len()
        }))
    }

    async fn remove_expiring(&self, key: &str, payload: &str) -> BrokerResult<bool> {
        self.check()?;
        let mut state = self.lock_state();
        let Some(records) = state.expiring.get_mut(key) else {
            return Ok(false);
        };
        match records.iter().position(|(_, p)| p == payload) {
            Some(pos) => {
                records.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        self.check()?;
        let mut state = self.lock_state();
        state.queues.remove(key);
        state.delayed.remove(key);
        state.expiring.remove(key);
        Ok(())
    }

    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease: Duration,
    ) -> BrokerResult<Option<LockToken>> {
        let deadline = Instant::now() + wait;

        loop {
            self.check()?;

            let released = self.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let holder_expiry = {
                let mut state = self.lock_state();
                let now = Instant::now();
                match state.locks.get(name) {
                    Some(held) if held.expires_at > now => Some(held.expires_at),
                    _ => {
                        let token = LockToken::generate();
                        state.locks.insert(
                            name.to_string(),
                            HeldLock {
                                token: token.clone(),
                                expires_at: now + lease,
                            },
                        );
                        return Ok(Some(token));
                    }
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = holder_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, released).await;
        }
    }

    async fn unlock(&self, name: &str, token: &LockToken) -> BrokerResult<bool> {
        self.check()?;
        let released = {
            let mut state = self.lock_state();
            match state.locks.get(name) {
                Some(held) if &held.token == token => {
                    state.locks.remove(name);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.lock_released.notify_waiters();
        }
        Ok(released)
    }

    async fn keys(&self, pattern: &str) -> BrokerResult<Vec<String>> {
        self.check()?;
        let state = self.lock_state();
        let mut keys: Vec<String> = state
            .queues
            .keys()
            .chain(state.delayed.keys())
            .chain(state.expiring.keys())
            .filter(|key| glob_matches(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn arrivals(&self) -> BrokerResult<ArrivalStream> {
        self.check()?;
        let stream = BroadcastStream::new(self.arrivals.subscribe())
            .filter_map(|event| event.ok());
        Ok(Box::pin(stream))
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_queue_fifo() {
        let store = InMemoryStore::new();
        store.offer("q", "a".into()).await.unwrap();
        store.offer("q", "b".into()).await.unwrap();
        store.offer("q", "c".into()).await.unwrap();

        assert_eq!(store.size("q").await.unwrap(), 3);
        assert_eq!(store.peek("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.peek_batch("q", 2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.poll("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.remove_head("q", 5).await.unwrap(), 2);
        assert_eq!(store.size("q").await.unwrap(), 0);
        assert_eq!(store.poll("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_exclusive_until_released() {
        let store = InMemoryStore::new();
        let lease = Duration::from_secs(30);
        let token = store
            .try_lock("l", Duration::ZERO, lease)
            .await
            .unwrap()
            .unwrap();

        let second = store.try_lock("l", Duration::from_millis(20), lease).await;
        assert!(second.unwrap().is_none());

        assert!(!store.unlock("l", &LockToken::generate()).await.unwrap());
        assert!(store.unlock("l", &token).await.unwrap());
        assert!(
            store
                .try_lock("l", Duration::ZERO, lease)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_lock_waiter_wakes_on_release() {
        let store = Arc::new(InMemoryStore::new());
        let lease = Duration::from_secs(30);
        let token = store
            .try_lock("l", Duration::ZERO, lease)
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.try_lock("l", Duration::from_secs(5), lease).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.unlock("l", &token).await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn test_lock_lease_expires() {
        let store = InMemoryStore::new();
        store
            .try_lock("l", Duration::ZERO, Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        assert!(store.is_locked("l"));

        let next = store
            .try_lock("l", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_delayed_promotion() {
        let store = InMemoryStore::new();
        store
            .offer_delayed("d", "later".into(), Duration::from_millis(40))
            .await
            .unwrap();
        store
            .offer_delayed("d", "now".into(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(store.promote_due("d", "q").await.unwrap(), 1);
        assert_eq!(store.peek("q").await.unwrap().as_deref(), Some("now"));
        assert_eq!(store.delayed_size("d").await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.promote_due("d", "q").await.unwrap(), 1);
        assert_eq!(store.size("q").await.unwrap(), 2);
        assert_eq!(store.delayed_size("d").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expiring_records() {
        let store = InMemoryStore::new();
        store
            .add_expiring("dl", "short".into(), Duration::from_millis(20))
            .await
            .unwrap();
        store
            .add_expiring("dl", "long".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.count_expiring("dl").await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.list_expiring("dl", 10).await.unwrap(), vec!["long"]);
        assert!(store.remove_expiring("dl", "long").await.unwrap());
        assert!(!store.remove_expiring("dl", "long").await.unwrap());
        assert_eq!(store.count_expiring("dl").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let store = InMemoryStore::new();
        store.offer("orders.queue", "x".into()).await.unwrap();
        store.offer("billing.queue", "x".into()).await.unwrap();
        store
            .add_expiring("orders_dead_letter", "x".into(), Duration::from_secs(5))
            .await
            .unwrap();

        let keys = store.keys("*.queue").await.unwrap();
        assert_eq!(keys, vec!["billing.queue", "orders.queue"]);
    }

    #[tokio::test]
    async fn test_arrivals_stream() {
        let store = InMemoryStore::new();
        let mut arrivals = store.arrivals().await.unwrap();
        store.offer("orders.queue", "x".into()).await.unwrap();

        let key = tokio::time::timeout(Duration::from_secs(1), arrivals.next())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("orders.queue"));
    }

    #[tokio::test]
    async fn test_shutdown_and_injected_failures() {
        let store = InMemoryStore::new();
        store.inject_failures(true);
        assert!(matches!(
            store.size("q").await,
            Err(BrokerError::Store(_))
        ));
        store.inject_failures(false);
        assert_eq!(store.size("q").await.unwrap(), 0);

        store.shutdown();
        assert!(store.is_shutdown());
        assert!(matches!(
            store.offer("q", "x".into()).await,
            Err(BrokerError::StoreShutdown)
        ));
    }

    #[tokio::test]
    async fn test_huge_delay_stays_parked() {
        let store = InMemoryStore::new();
        store
            .offer_delayed("q_retry", "late".into(), Duration::MAX)
            .await
            .unwrap();
        store
            .add_expiring("q_dead_letter", "kept".into(), Duration::MAX)
            .await
            .unwrap();

        assert_eq!(store.promote_due("q_retry", "q").await.unwrap(), 0);
        assert_eq!(store.delayed_size("q_retry").await.unwrap(), 1);
        assert_eq!(store.count_expiring("q_dead_letter").await.unwrap(), 1);
    }
}
