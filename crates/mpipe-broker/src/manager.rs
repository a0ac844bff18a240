//! Pipe lifecycle: lazy creation, recovery and idle reaping

use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MessagePipeConfiguration, ServerConfiguration};
use crate::discovery::ClientRegistry;
use crate::distributor::PipeDistributor;
use crate::error::{BrokerError, BrokerResult};
use crate::message::Message;
use crate::metrics::MetricsAggregator;
use crate::pipe::Pipe;
use crate::retry::RetryScheduler;
use crate::scheduler::PipeScheduler;
use crate::store::DurableStore;
use crate::transport::ConsumerTransport;
use crate::types::PipeName;

/// A cached pipe with its running worker
pub struct PipeHandle {
    pipe: Arc<Pipe>,
    scheduler: Arc<PipeScheduler>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PipeHandle {
    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    pub fn scheduler(&self) -> &Arc<PipeScheduler> {
        &self.scheduler
    }

    /// Flag the pipe stopped and wait for its worker to exit
    async fn shutdown(&self) {
        self.pipe.stop();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(pipe = %self.pipe.name(), error = %e, "Pipe worker panicked");
            }
        }
    }
}

/// Registry of live pipes
pub struct PipeManager {
    store: Arc<dyn DurableStore>,
    registry: Arc<ClientRegistry>,
    transport: Arc<dyn ConsumerTransport>,
    retry: Arc<RetryScheduler>,
    metrics: Arc<MetricsAggregator>,
    default_config: Arc<MessagePipeConfiguration>,
    pipe_configs: DashMap<PipeName, Arc<MessagePipeConfiguration>>,
    exclude_patterns: Vec<Regex>,
    max_pipe_count: usize,
    idle_threshold: Duration,
    retry_record_ttl: Duration,
    pipes: DashMap<PipeName, Arc<PipeHandle>>,
    creation: Mutex<()>,
    stop_tx: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PipeManager {
    /// # Errors
    ///
    /// Returns `BrokerError::Configuration` if an exclusion pattern does not
    /// compile.
    pub fn new(
        server: &ServerConfiguration,
        store: Arc<dyn DurableStore>,
        registry: Arc<ClientRegistry>,
        transport: Arc<dyn ConsumerTransport>,
        retry: Arc<RetryScheduler>,
        metrics: Arc<MetricsAggregator>,
    ) -> BrokerResult<Self> {
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            store,
            registry,
            transport,
            retry,
            metrics,
            default_config: Arc::new(MessagePipeConfiguration::default()),
            pipe_configs: DashMap::new(),
            exclude_patterns: server.compiled_exclude_patterns()?,
            max_pipe_count: server.max_pipe_count,
            idle_threshold: server.pipe_idle_threshold(),
            retry_record_ttl: server.retry_record_ttl(),
            pipes: DashMap::new(),
            creation: Mutex::new(()),
            stop_tx,
            reaper: Mutex::new(None),
        })
    }

    /// Policy for every pipe without an override
    pub fn with_default_configuration(mut self, config: MessagePipeConfiguration) -> Self {
        self.default_config = Arc::new(config);
        self
    }

    /// Policy for one pipe, used when it is next created
    pub fn with_pipe_configuration(self, name: PipeName, config: MessagePipeConfiguration) -> Self {
        self.pipe_configs.insert(name, Arc::new(config));
        self
    }

    pub fn configuration_for(&self, name: &PipeName) -> Arc<MessagePipeConfiguration> {
        self.pipe_configs
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .unwrap_or_else(|| Arc::clone(&self.default_config))
    }

    pub fn is_excluded(&self, name: &PipeName) -> bool {
        self.exclude_patterns
            .iter()
            .any(|pattern| pattern.is_match(name.as_str()))
    }

    /// Existing pipe, or a new one with its worker started
    ///
    /// `Ok(None)` means the name matches an exclusion pattern.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::CapacityExceeded` when `max_pipe_count` pipes
    /// are already live.
    pub async fn create_message_pipe(&self, name: &PipeName) -> BrokerResult<Option<Arc<Pipe>>> {
        if let Some(handle) = self.pipes.get(name) {
            return Ok(Some(Arc::clone(&handle.pipe)));
        }
        if self.is_excluded(name) {
            info!(pipe = %name, "Pipe name excluded, not creating");
            return Ok(None);
        }

        let _guard = self.creation.lock().await;
        if let Some(handle) = self.pipes.get(name) {
            return Ok(Some(Arc::clone(&handle.pipe)));
        }
        if self.pipes.len() >= self.max_pipe_count {
            warn!(pipe = %name, limit = self.max_pipe_count, "Pipe limit reached");
            return Err(BrokerError::CapacityExceeded {
                limit: self.max_pipe_count,
            });
        }

        let pipe = Arc::new(Pipe::new(
            name.clone(),
            Arc::clone(&self.store),
            self.configuration_for(name),
            Arc::clone(&self.metrics),
        ));
        let distributor = Arc::new(PipeDistributor::new(
            Arc::clone(&pipe),
            Arc::clone(&self.registry),
            Arc::clone(&self.transport),
            Arc::clone(&self.retry),
            Arc::clone(&self.metrics),
        ));
        let scheduler = Arc::new(PipeScheduler::new(distributor));
        self.metrics.register(&pipe);
        let worker = scheduler.spawn();

        self.pipes.insert(
            name.clone(),
            Arc::new(PipeHandle {
                pipe: Arc::clone(&pipe),
                scheduler,
                worker: std::sync::Mutex::new(Some(worker)),
            }),
        );
        info!(pipe = %name, live = self.pipes.len(), "Pipe created");
        Ok(Some(pipe))
    }

    /// Create-if-absent lookup by raw name
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidName` for an unusable name, or the
    /// errors of [`PipeManager::create_message_pipe`].
    pub async fn get_message_pipe(&self, name: &str) -> BrokerResult<Option<Arc<Pipe>>> {
        let name = PipeName::parse(name).map_err(|e| BrokerError::from((name.to_string(), e)))?;
        self.create_message_pipe(&name).await
    }

    /// Cached pipe without creating one
    pub fn cached_pipe(&self, name: &PipeName) -> Option<Arc<Pipe>> {
        self.pipes.get(name).map(|h| Arc::clone(&h.pipe))
    }

    pub fn handle(&self, name: &PipeName) -> Option<Arc<PipeHandle>> {
        self.pipes.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn pipe_names(&self) -> Vec<PipeName> {
        let mut names: Vec<PipeName> = self.pipes.iter().map(|h| h.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    /// Producer path
    ///
    /// `Ok(false)` means the pipe is excluded or the store refused the
    /// message; the exception handler has already seen the latter.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`PipeManager::get_message_pipe`].
    pub async fn put(&self, name: &str, message: Message) -> BrokerResult<bool> {
        match self.get_message_pipe(name).await? {
            Some(pipe) => {
                let stored = pipe.put(message).await;
                if stored && pipe.is_scheduler_stopped() {
                    // Reaped in between; wake the replacement worker
                    if let Some(live) = self.get_message_pipe(name).await? {
                        live.notify_new_message();
                    }
                }
                Ok(stored)
            }
            None => {
                warn!(pipe = %name, message_id = %message.id, "Put to excluded pipe ignored");
                Ok(false)
            }
        }
    }

    /// A queue key received a message, possibly from another process
    pub async fn on_message_arrived(&self, queue_key: &str) {
        let Some(name) = PipeName::from_queue_key(queue_key) else {
            debug!(key = %queue_key, "Ignoring arrival on non-queue key");
            return;
        };
        match self.create_message_pipe(&name).await {
            Ok(Some(pipe)) => pipe.notify_new_message(),
            Ok(None) => {}
            Err(e) => warn!(pipe = %name, error = %e, "Cannot serve arrival"),
        }
    }

    /// Wake every worker, e.g. after a consumer registered
    pub fn wake_all(&self) {
        for handle in self.pipes.iter() {
            handle.pipe.notify_new_message();
        }
    }

    /// Create pipes for every queue already in the store
    pub async fn recover_pipes(&self) -> usize {
        let keys = match self.store.keys(PipeName::queue_key_pattern()).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Failed to enumerate queues for recovery");
                return 0;
            }
        };

        let mut recovered = 0;
        for key in keys {
            let Some(name) = PipeName::from_queue_key(&key) else {
                continue;
            };
            match self.create_message_pipe(&name).await {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => {}
                Err(e) => warn!(pipe = %name, error = %e, "Failed to recover pipe"),
            }
        }
        info!(recovered, "Pipes recovered from store");
        recovered
    }

    /// Stop and evict pipes idle longer than the threshold
    ///
    /// The durable queue is left untouched; a later arrival recreates the
    /// pipe.
    pub async fn reap_idle(&self) -> Vec<PipeName> {
        let idle: Vec<PipeName> = self
            .pipes
            .iter()
            .filter(|h| h.pipe.idle_time() > self.idle_threshold)
            .map(|h| h.key().clone())
            .collect();

        let mut reaped = Vec::with_capacity(idle.len());
        for name in idle {
            let Some((_, handle)) = self.pipes.remove(&name) else {
                continue;
            };
            handle.shutdown().await;
            self.metrics.unregister(&name);
            info!(
                pipe = %name,
                idle_secs = handle.pipe.idle_time().as_secs(),
                "Idle pipe reaped"
            );
            reaped.push(name);
        }
        reaped
    }

    /// Forget retry records that went quiet, e.g. delivered elsewhere
    pub fn sweep_retry_records(&self) -> usize {
        self.retry.sweep_stale(self.retry_record_ttl)
    }

    /// Run [`PipeManager::reap_idle`] and the retry record sweep every
    /// `interval` until stopped
    pub async fn start_reaper(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticks.tick() => {
                        let reaped = manager.reap_idle().await;
                        let swept = manager.sweep_retry_records();
                        if !reaped.is_empty() || swept > 0 {
                            debug!(count = reaped.len(), swept, "Reaper pass finished");
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.reaper.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Stop the reaper and every pipe, joining their tasks
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let reaper = self.reaper.lock().await.take();
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                error!(error = %e, "Reaper task panicked");
            }
        }

        let names: Vec<PipeName> = self.pipes.iter().map(|h| h.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.pipes.remove(&name) {
                handle.shutdown().await;
                self.metrics.unregister(&name);
            }
        }
        info!("Pipe manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ClientInformation;
    use crate::dlq::DeadLetterSink;
    use crate::message::{RequestBody, ResponseBody};
    use crate::store::InMemoryStore;
    use crate::transport::TransportError;
    use crate::types::ClientId;
    use crate::config::MetricsThresholds;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl ConsumerTransport for Unreachable {
        async fn message_processing(
            &self,
            _client: &ClientInformation,
            _request: &RequestBody,
        ) -> Result<ResponseBody, TransportError> {
            Err(TransportError::Unavailable("test".into()))
        }

        fn invalidate(&self, _client_id: &ClientId) {}
    }

    fn manager_with(server: ServerConfiguration) -> (Arc<InMemoryStore>, PipeManager) {
        let store = Arc::new(InMemoryStore::new());
        let dyn_store: Arc<dyn DurableStore> = store.clone();
        let metrics = Arc::new(MetricsAggregator::new(MetricsThresholds::default()));
        let manager = PipeManager::new(
            &server,
            Arc::clone(&dyn_store),
            Arc::new(ClientRegistry::new(Duration::from_secs(30))),
            Arc::new(Unreachable),
            Arc::new(RetryScheduler::new(Arc::new(DeadLetterSink::new(dyn_store)))),
            metrics,
        )
        .unwrap()
        .with_default_configuration(
            MessagePipeConfiguration::new().with_monitor_interval(Duration::from_millis(20)),
        );
        (store, manager)
    }

    fn manager() -> (Arc<InMemoryStore>, PipeManager) {
        manager_with(ServerConfiguration::default())
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (_, manager) = manager();
        let name = PipeName::parse("orders").unwrap();

        let first = manager.create_message_pipe(&name).await.unwrap().unwrap();
        let second = manager.create_message_pipe(&name).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_pipe() {
        let (_, manager) = manager();
        let manager = Arc::new(manager);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get_message_pipe("orders").await })
            })
            .collect();
        let pipes: Vec<Arc<Pipe>> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().unwrap())
            .collect();

        assert!(pipes.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(manager.len(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_excluded_names_are_skipped() {
        let server = ServerConfiguration {
            exclude_pipe_patterns: vec!["internal\\..*".to_string()],
            ..ServerConfiguration::default()
        };
        let (_, manager) = manager_with(server);

        assert!(manager.get_message_pipe("internal.audit").await.unwrap().is_none());
        assert!(!manager.put("internal.audit", Message::new("x")).await.unwrap());
        assert!(manager.get_message_pipe("orders.internal.audit").await.unwrap().is_some());
        assert_eq!(manager.len(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let server = ServerConfiguration {
            max_pipe_count: 2,
            ..ServerConfiguration::default()
        };
        let (_, manager) = manager_with(server);

        manager.get_message_pipe("a").await.unwrap();
        manager.get_message_pipe("b").await.unwrap();
        let err = manager.get_message_pipe("c").await.unwrap_err();
        assert!(matches!(err, BrokerError::CapacityExceeded { limit: 2 }));
        assert!(manager.get_message_pipe("a").await.unwrap().is_some());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let (_, manager) = manager();
        let err = manager.get_message_pipe("").await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn test_reaped_pipe_revives_with_backlog() {
        let server = ServerConfiguration {
            pipe_idle_threshold_secs: 0,
            ..ServerConfiguration::default()
        };
        let (_, manager) = manager_with(server);

        for _ in 0..3 {
            assert!(manager.put("orders", Message::new("x")).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reaped = manager.reap_idle().await;
        assert_eq!(reaped, vec![PipeName::parse("orders").unwrap()]);
        assert!(manager.is_empty());

        let revived = manager.get_message_pipe("orders").await.unwrap().unwrap();
        assert_eq!(revived.size().await, 3);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_put_through_reaped_handle_is_kept() {
        let server = ServerConfiguration {
            pipe_idle_threshold_secs: 0,
            ..ServerConfiguration::default()
        };
        let (store, manager) = manager_with(server);

        let stale = manager.get_message_pipe("orders").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.reap_idle().await;
        assert!(stale.is_scheduler_stopped());

        assert!(stale.put(Message::with_id("m-1", "x")).await);
        assert_eq!(store.size("orders.queue").await.unwrap(), 1);

        let revived = manager.get_message_pipe("orders").await.unwrap().unwrap();
        assert_eq!(revived.peek().await.unwrap().id, "m-1");
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_drops_quiet_retry_records() {
        let server = ServerConfiguration {
            retry_record_ttl_secs: 0,
            ..ServerConfiguration::default()
        };
        let (_, manager) = manager_with(server);
        let pipe = manager.get_message_pipe("orders").await.unwrap().unwrap();

        manager
            .retry
            .handle_failure(&pipe, &Message::with_id("m-1", "x"), "ERROR")
            .await;
        assert_eq!(manager.retry.pending(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.sweep_retry_records(), 1);
        assert_eq!(manager.retry.pending(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_recover_and_arrivals_create_pipes() {
        let (store, manager) = manager();
        store.offer("orders.queue", "{}".into()).await.unwrap();
        store.offer("billing.queue", "{}".into()).await.unwrap();
        store.offer("unrelated", "{}".into()).await.unwrap();

        assert_eq!(manager.recover_pipes().await, 2);
        assert_eq!(
            manager.pipe_names(),
            vec![
                PipeName::parse("billing").unwrap(),
                PipeName::parse("orders").unwrap()
            ]
        );

        manager.on_message_arrived("audit.queue").await;
        manager.on_message_arrived("not-a-queue").await;
        assert_eq!(manager.len(), 3);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_joins_workers() {
        let (_, manager) = manager();
        let pipe = manager.get_message_pipe("orders").await.unwrap().unwrap();
        manager.stop().await;

        assert!(pipe.is_scheduler_stopped());
        assert!(manager.is_empty());
        assert_eq!(manager.metrics.monitored_pipes(), 0);
    }

    #[tokio::test]
    async fn test_per_pipe_configuration_override() {
        let (_, manager) = manager();
        let manager = manager.with_pipe_configuration(
            PipeName::parse("bulk").unwrap(),
            MessagePipeConfiguration::new().with_batch_size(500),
        );

        let bulk = manager.get_message_pipe("bulk").await.unwrap().unwrap();
        let other = manager.get_message_pipe("orders").await.unwrap().unwrap();
        assert_eq!(bulk.config().batch_size, 500);
        assert_eq!(other.config().batch_size, 100);
        manager.stop().await;
    }
}
