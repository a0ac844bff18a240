//! Broker assembly and lifecycle
//!
//! [`BrokerBuilder`] wires the store, consumer transport and configuration
//! into the registry, discovery service, retry scheduler, dead letter sink,
//! metrics aggregator and pipe manager. [`Broker::start`] brings the
//! background tasks up; [`Broker::stop`] tears them down and joins them.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MessagePipeConfiguration, ServerConfiguration};
use crate::discovery::{ClientRegistry, DiscoveryService, LoadBalanceStrategy};
use crate::dlq::{DeadLetterRecord, DeadLetterSink};
use crate::error::{BrokerError, BrokerResult};
use crate::manager::PipeManager;
use crate::message::{HeartbeatResponse, Message, RegisterResponse, RpcStatus};
use crate::metrics::{ClusterReport, MetricsAggregator};
use crate::retry::RetryScheduler;
use crate::store::{DurableStore, InMemoryStore};
use crate::transport::ConsumerTransport;
use crate::types::PipeName;

/// Builder for [`Broker`]
pub struct BrokerBuilder {
    server: ServerConfiguration,
    pipe_config: MessagePipeConfiguration,
    pipe_overrides: Vec<(PipeName, MessagePipeConfiguration)>,
    store: Option<Arc<dyn DurableStore>>,
    transport: Option<Arc<dyn ConsumerTransport>>,
    registry_strategy: Option<Arc<dyn LoadBalanceStrategy>>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self {
            server: ServerConfiguration::default(),
            pipe_config: MessagePipeConfiguration::default(),
            pipe_overrides: Vec::new(),
            store: None,
            transport: None,
            registry_strategy: None,
        }
    }

    pub fn server_configuration(mut self, config: ServerConfiguration) -> Self {
        self.server = config;
        self
    }

    /// Default policy for every pipe
    pub fn pipe_configuration(mut self, config: MessagePipeConfiguration) -> Self {
        self.pipe_config = config;
        self
    }

    /// Policy override for one pipe
    pub fn pipe_override(mut self, name: PipeName, config: MessagePipeConfiguration) -> Self {
        self.pipe_overrides.push((name, config));
        self
    }

    /// Backend store; an [`InMemoryStore`] is used when none is given
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ConsumerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Balancing for every pipe without its own strategy
    pub fn registry_strategy(mut self, strategy: Arc<dyn LoadBalanceStrategy>) -> Self {
        self.registry_strategy = Some(strategy);
        self
    }

    /// # Errors
    ///
    /// Returns `BrokerError::Configuration` when the server configuration
    /// is invalid or no consumer transport was given.
    pub fn build(self) -> BrokerResult<Broker> {
        self.server.validate()?;
        let transport = self.transport.ok_or_else(|| {
            BrokerError::Configuration("a consumer transport is required".to_string())
        })?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn DurableStore>);

        let registry = match self.registry_strategy {
            Some(strategy) => {
                ClientRegistry::with_strategy(self.server.expired_exclude_threshold(), strategy)
            }
            None => ClientRegistry::new(self.server.expired_exclude_threshold()),
        };
        let registry = Arc::new(registry);
        let metrics = Arc::new(MetricsAggregator::new(self.server.metrics.clone()));
        let discovery = Arc::new(
            DiscoveryService::new(Arc::clone(&registry), self.server.expire_check_interval())
                .with_metrics(Arc::clone(&metrics)),
        );
        let dead_letters = Arc::new(DeadLetterSink::new(Arc::clone(&store)));
        let retry = Arc::new(RetryScheduler::new(Arc::clone(&dead_letters)));

        let mut manager = PipeManager::new(
            &self.server,
            Arc::clone(&store),
            Arc::clone(&registry),
            transport,
            retry,
            Arc::clone(&metrics),
        )?
        .with_default_configuration(self.pipe_config);
        for (name, config) in self.pipe_overrides {
            manager = manager.with_pipe_configuration(name, config);
        }

        let (stop_tx, _) = watch::channel(false);
        Ok(Broker {
            config: self.server,
            store,
            registry,
            discovery,
            dead_letters,
            metrics,
            manager: Arc::new(manager),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// A running (or runnable) broker node
pub struct Broker {
    config: ServerConfiguration,
    store: Arc<dyn DurableStore>,
    registry: Arc<ClientRegistry>,
    discovery: Arc<DiscoveryService>,
    dead_letters: Arc<DeadLetterSink>,
    metrics: Arc<MetricsAggregator>,
    manager: Arc<PipeManager>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfiguration {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    pub fn manager(&self) -> &Arc<PipeManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        &self.dead_letters
    }

    /// Recover pipes and start every background task
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Configuration` if the broker was started before.
    pub async fn start(&self) -> BrokerResult<()> {
        self.discovery.start().await?;
        let recovered = self.manager.recover_pipes().await;
        self.manager.start_reaper(self.config.reaper_interval()).await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(
            self.metrics
                .spawn_reporter(self.config.metrics_report_interval(), self.stop_tx.subscribe()),
        );
        if let Some(listener) = self.spawn_arrival_listener().await {
            tasks.push(listener);
        }

        info!(
            recovered,
            max_pipes = self.config.max_pipe_count,
            "Broker started"
        );
        Ok(())
    }

    async fn spawn_arrival_listener(&self) -> Option<JoinHandle<()>> {
        let mut arrivals = match self.store.arrivals().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Store arrivals unavailable, relying on local notifications");
                return None;
            }
        };
        let manager = Arc::clone(&self.manager);
        let mut stop = self.stop_tx.subscribe();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    next = arrivals.next() => match next {
                        Some(key) => manager.on_message_arrived(&key).await,
                        None => {
                            warn!("Store arrivals stream ended");
                            break;
                        }
                    },
                }
            }
            debug!("Arrival listener stopped");
        }))
    }

    /// Stop every task and pipe worker
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Broker task panicked");
            }
        }
        self.manager.stop().await;
        self.discovery.stop().await;
        info!("Broker stopped");
    }

    /// Register a consumer and wake the pipes it may serve
    pub async fn register(&self, address: &str, port: u16, pipe_names: &str) -> RegisterResponse {
        let response = self.discovery.register(address, port, pipe_names).await;
        if response.status == RpcStatus::Ok {
            self.manager.wake_all();
        }
        response
    }

    pub async fn heartbeat(&self, address: &str, port: u16) -> HeartbeatResponse {
        let response = self.discovery.heartbeat(address, port).await;
        if response.status == RpcStatus::Ok {
            self.manager.wake_all();
        }
        response
    }

    /// Producer path
    ///
    /// # Errors
    ///
    /// See [`PipeManager::put`].
    pub async fn put(&self, pipe: &str, message: Message) -> BrokerResult<bool> {
        self.manager.put(pipe, message).await
    }

    /// Deliverable size of a pipe, creating it if needed
    ///
    /// # Errors
    ///
    /// See [`PipeManager::get_message_pipe`].
    pub async fn pipe_size(&self, pipe: &str) -> BrokerResult<Option<usize>> {
        match self.manager.get_message_pipe(pipe).await? {
            Some(pipe) => Ok(Some(pipe.size().await)),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Returns `BrokerError::InvalidName` for an unusable pipe name.
    pub async fn dead_letters_of(
        &self,
        pipe: &str,
        limit: usize,
    ) -> BrokerResult<Vec<DeadLetterRecord>> {
        let name = parse_name(pipe)?;
        Ok(self.dead_letters.list_messages(&name, limit).await)
    }

    /// # Errors
    ///
    /// Returns `BrokerError::InvalidName` for an unusable pipe name.
    pub async fn dead_letter_count(&self, pipe: &str) -> BrokerResult<usize> {
        let name = parse_name(pipe)?;
        Ok(self.dead_letters.size(&name).await)
    }

    /// # Errors
    ///
    /// Returns `BrokerError::InvalidName` for an unusable pipe name.
    pub async fn clear_dead_letters(&self, pipe: &str) -> BrokerResult<bool> {
        let name = parse_name(pipe)?;
        Ok(self.dead_letters.clear(&name).await)
    }

    pub async fn report(&self) -> ClusterReport {
        self.metrics.report().await
    }
}

fn parse_name(pipe: &str) -> BrokerResult<PipeName> {
    PipeName::parse(pipe).map_err(|e| BrokerError::from((pipe.to_string(), e)))
}
