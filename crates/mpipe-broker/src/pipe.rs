//! A named pipe over one durable queue
//!
//! Every access that consumes the head of the queue runs under the pipe's
//! distributed "take" lock, and every produce under its "put" lock, so
//! brokers sharing a store never hand the same head message to two
//! consumers. A message leaves the queue only after its handler reported
//! success.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::config::MessagePipeConfiguration;
use crate::error::{BrokerError, BrokerResult};
use crate::exception::FailureStatus;
use crate::message::Message;
use crate::metrics::MetricsAggregator;
use crate::store::{DurableStore, LockToken};
use crate::types::PipeName;

/// What one locked batch attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchResult {
    /// Another holder kept the take lock for the whole wait
    LockNotAcquired,
    /// Nothing to hand out
    Empty,
    /// The handler released this many messages and they were removed
    Removed(usize),
    /// The handler asked to keep the batch in place
    Retained,
}

/// A named message pipe
pub struct Pipe {
    name: PipeName,
    queue_key: String,
    take_lock_key: String,
    put_lock_key: String,
    retry_key: String,
    store: Arc<dyn DurableStore>,
    config: Arc<MessagePipeConfiguration>,
    metrics: Arc<MetricsAggregator>,
    last_process_time_millis: AtomicI64,
    total_input_count: AtomicU64,
    total_process_count: AtomicU64,
    stop_scheduler: AtomicBool,
    stop_monitor: AtomicBool,
    new_message: Notify,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Pipe {
    pub fn new(
        name: PipeName,
        store: Arc<dyn DurableStore>,
        config: Arc<MessagePipeConfiguration>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            queue_key: name.queue_key(),
            take_lock_key: name.take_lock_key(),
            put_lock_key: name.put_lock_key(),
            retry_key: name.retry_key(),
            name,
            store,
            config,
            metrics,
            last_process_time_millis: AtomicI64::new(now_millis()),
            total_input_count: AtomicU64::new(0),
            total_process_count: AtomicU64::new(0),
            stop_scheduler: AtomicBool::new(false),
            stop_monitor: AtomicBool::new(false),
            new_message: Notify::new(),
        }
    }

    pub fn name(&self) -> &PipeName {
        &self.name
    }

    pub fn config(&self) -> &Arc<MessagePipeConfiguration> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Append a message; failures go to the exception handler
    ///
    /// A stopped pipe still accepts messages: stopping retires the local
    /// worker, while the durable queue behind the name stays open.
    pub async fn put(&self, message: Message) -> bool {
        if self.store.is_shutdown() {
            self.put_failed(&message, &BrokerError::StoreShutdown);
            return false;
        }

        let token = match self.acquire(&self.put_lock_key).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.put_failed(&message, &BrokerError::Timeout(self.config.lock_wait));
                return false;
            }
            Err(e) => {
                self.put_failed(&message, &e);
                return false;
            }
        };

        let result = match self.config.codec.encode(&message) {
            Ok(raw) => self.store.offer(&self.queue_key, raw).await,
            Err(e) => Err(e),
        };
        self.release(&self.put_lock_key, &token).await;

        match result {
            Ok(()) => {
                self.total_input_count.fetch_add(1, Ordering::Relaxed);
                debug!(pipe = %self.name, message_id = %message.id, "Message stored");
                self.notify_new_message();
                true
            }
            Err(e) => {
                self.put_failed(&message, &e);
                false
            }
        }
    }

    fn put_failed(&self, message: &Message, err: &BrokerError) {
        self.metrics.record_dropped_message(&self.name);
        self.config.exception_handler.handle(
            &self.name,
            Some(message),
            FailureStatus::PutException,
            err,
        );
    }

    /// Head message without removing it
    pub async fn peek(&self) -> Option<Message> {
        self.promote_retries().await;
        match self.store.peek(&self.queue_key).await {
            Ok(raw) => raw.and_then(|raw| self.decode(&raw)),
            Err(e) => {
                self.store_failed("peek", &e);
                None
            }
        }
    }

    /// Up to `max` messages from the head without removing them
    pub async fn peek_batch(&self, max: usize) -> Vec<Message> {
        self.promote_retries().await;
        match self.store.peek_batch(&self.queue_key, max).await {
            Ok(raws) => raws.iter().filter_map(|raw| self.decode(raw)).collect(),
            Err(e) => {
                self.store_failed("peek_batch", &e);
                Vec::new()
            }
        }
    }

    /// Remove and return the head message
    pub async fn poll(&self) -> Option<Message> {
        self.promote_retries().await;
        match self.store.poll(&self.queue_key).await {
            Ok(raw) => raw.and_then(|raw| self.decode(&raw)),
            Err(e) => {
                self.store_failed("poll", &e);
                None
            }
        }
    }

    /// Messages currently deliverable, including retries now due
    pub async fn size(&self) -> usize {
        self.promote_retries().await;
        match self.store.size(&self.queue_key).await {
            Ok(size) => size,
            Err(e) => {
                self.store_failed("size", &e);
                0
            }
        }
    }

    /// Hand the head message to `handler` under the take lock
    ///
    /// The message is removed only when the handler returns `Ok(true)`.
    /// Returns whether a message was removed.
    pub async fn lock_handle_first<F, Fut>(&self, handler: F) -> bool
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = BrokerResult<bool>>,
    {
        let token = match self.acquire(&self.take_lock_key).await {
            Ok(Some(token)) => token,
            Ok(None) => return false,
            Err(e) => {
                self.store_failed("take lock", &e);
                return false;
            }
        };

        let outcome = self.handle_first_locked(handler).await;

        self.release(&self.take_lock_key, &token).await;

        outcome.unwrap_or_else(|e| {
            self.config.exception_handler.handle(
                &self.name,
                None,
                FailureStatus::SendException,
                &e,
            );
            false
        })
    }

    /// Hand up to `max` head messages to `handler` under the take lock
    ///
    /// The handler returns how many messages, counted from the head, may
    /// be removed, or `None` to keep the batch in place.
    pub async fn lock_handle_batch<F, Fut>(&self, max: usize, handler: F) -> BatchResult
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Option<usize>>,
    {
        let token = match self.acquire(&self.take_lock_key).await {
            Ok(Some(token)) => token,
            Ok(None) => return BatchResult::LockNotAcquired,
            Err(e) => {
                self.store_failed("take lock", &e);
                return BatchResult::Retained;
            }
        };

        let outcome = self.handle_batch_locked(max, handler).await;

        self.release(&self.take_lock_key, &token).await;

        outcome.unwrap_or_else(|e| {
            self.config.exception_handler.handle(
                &self.name,
                None,
                FailureStatus::SendException,
                &e,
            );
            BatchResult::Retained
        })
    }

    async fn handle_first_locked<F, Fut>(&self, handler: F) -> BrokerResult<bool>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = BrokerResult<bool>>,
    {
        self.promote_retries().await;
        let Some(raw) = self.store.peek(&self.queue_key).await? else {
            return Ok(false);
        };
        let Some(message) = self.decode(&raw) else {
            self.drop_poison_head().await?;
            return Ok(false);
        };

        match handler(message.clone()).await {
            Ok(true) => {
                self.store.poll(&self.queue_key).await?;
                self.record_processed(1);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.config.exception_handler.handle(
                    &self.name,
                    Some(&message),
                    FailureStatus::SendException,
                    &e,
                );
                Ok(false)
            }
        }
    }

    async fn handle_batch_locked<F, Fut>(
        &self,
        max: usize,
        handler: F,
    ) -> BrokerResult<BatchResult>
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Option<usize>>,
    {
        self.promote_retries().await;
        let raws = self.store.peek_batch(&self.queue_key, max).await?;
        if raws.is_empty() {
            return Ok(BatchResult::Empty);
        }

        let mut batch = Vec::with_capacity(raws.len());
        for raw in &raws {
            match self.decode(raw) {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        if batch.is_empty() {
            self.drop_poison_head().await?;
            return Ok(BatchResult::Retained);
        }

        let offered = batch.len();
        match handler(batch).await {
            Some(n) if n > 0 => {
                let removed = self
                    .store
                    .remove_head(&self.queue_key, n.min(offered))
                    .await?;
                self.record_processed(removed);
                Ok(BatchResult::Removed(removed))
            }
            _ => Ok(BatchResult::Retained),
        }
    }

    async fn acquire(&self, lock: &str) -> BrokerResult<Option<LockToken>> {
        self.store
            .try_lock(lock, self.config.lock_wait, self.config.lock_lease)
            .await
    }

    async fn release(&self, lock: &str, token: &LockToken) {
        if self.store.is_shutdown() {
            return;
        }
        match self.store.unlock(lock, token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(pipe = %self.name, lock = %lock, "Lock lease lapsed before release");
            }
            Err(e) => self.store_failed("unlock", &e),
        }
    }

    async fn promote_retries(&self) {
        if self.store.is_shutdown() {
            return;
        }
        if let Err(e) = self.store.promote_due(&self.retry_key, &self.queue_key).await {
            self.store_failed("promote retries", &e);
        }
    }

    async fn drop_poison_head(&self) -> BrokerResult<()> {
        let removed = self.store.remove_head(&self.queue_key, 1).await?;
        if removed > 0 {
            error!(pipe = %self.name, "Dropped undecodable message at queue head");
            self.metrics.record_dropped_message(&self.name);
        }
        Ok(())
    }

    fn decode(&self, raw: &str) -> Option<Message> {
        match self.config.codec.decode(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                error!(pipe = %self.name, error = %e, "Undecodable queue entry");
                None
            }
        }
    }

    fn store_failed(&self, operation: &str, err: &BrokerError) {
        if matches!(err, BrokerError::StoreShutdown) {
            debug!(pipe = %self.name, operation = %operation, "Store is shut down");
        } else {
            error!(pipe = %self.name, operation = %operation, error = %err, "Store operation failed");
        }
    }

    fn record_processed(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.total_process_count
            .fetch_add(count as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Refresh the last-activity timestamp
    pub fn touch(&self) {
        self.last_process_time_millis
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_process_time_millis(&self) -> i64 {
        self.last_process_time_millis.load(Ordering::Relaxed)
    }

    /// Time since the last removal (or creation)
    pub fn idle_time(&self) -> Duration {
        let idle = now_millis() - self.last_process_time_millis();
        Duration::from_millis(idle.max(0) as u64)
    }

    pub fn total_input_count(&self) -> u64 {
        self.total_input_count.load(Ordering::Relaxed)
    }

    pub fn total_process_count(&self) -> u64 {
        self.total_process_count.load(Ordering::Relaxed)
    }

    /// Wake the scheduler; the wakeup is kept if nobody is waiting yet
    pub fn notify_new_message(&self) {
        self.new_message.notify_one();
    }

    /// Sleep until a new-message notification or `timeout`
    pub async fn wait_for_message(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.new_message.notified()).await;
    }

    /// Flag the worker and metrics monitor to stop
    pub fn stop(&self) {
        self.stop_scheduler.store(true, Ordering::SeqCst);
        self.stop_monitor.store(true, Ordering::SeqCst);
        self.new_message.notify_one();
    }

    pub fn is_scheduler_stopped(&self) -> bool {
        self.stop_scheduler.load(Ordering::SeqCst)
    }

    pub fn is_monitor_stopped(&self) -> bool {
        self.stop_monitor.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.name)
            .field("total_input_count", &self.total_input_count())
            .field("total_process_count", &self.total_process_count())
            .field("stopped", &self.is_scheduler_stopped())
            .finish()
    }
}
