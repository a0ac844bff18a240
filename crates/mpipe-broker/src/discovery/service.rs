//! Discovery service: registration RPCs, event loop and expiry ticker

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ClientInformation, ClientRegistry, ServiceEvent};
use crate::error::{BrokerError, BrokerResult};
use crate::message::{HeartbeatResponse, RegisterResponse, RpcStatus};
use crate::metrics::MetricsAggregator;

const EVENT_CHANNEL_SIZE: usize = 1024;

struct Envelope {
    event: ServiceEvent,
    applied: Option<oneshot::Sender<()>>,
}

/// Apply `event`; an expiry pass also drops activity of clients now offline
fn apply_event(
    registry: &ClientRegistry,
    metrics: Option<&MetricsAggregator>,
    event: ServiceEvent,
) {
    let expiry = matches!(event, ServiceEvent::Expire);
    registry.apply(event);
    if let (true, Some(metrics)) = (expiry, metrics) {
        metrics.retain_clients(|id| registry.get(id).is_some_and(|c| c.is_online()));
    }
}

/// Owns the registry's event loop and expiry ticker
///
/// Before [`DiscoveryService::start`] (and after `stop`) events are applied
/// inline; while running they go through the event loop, and the RPC
/// helpers wait until their event has been applied.
pub struct DiscoveryService {
    registry: Arc<ClientRegistry>,
    metrics: Option<Arc<MetricsAggregator>>,
    expire_check_interval: Duration,
    sender: mpsc::Sender<Envelope>,
    receiver: Mutex<Option<mpsc::Receiver<Envelope>>>,
    stop_tx: watch::Sender<bool>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(registry: Arc<ClientRegistry>, expire_check_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (stop_tx, _) = watch::channel(false);
        Self {
            registry,
            metrics: None,
            expire_check_interval,
            sender,
            receiver: Mutex::new(Some(receiver)),
            stop_tx,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Prune client activity from `metrics` as clients expire
    pub fn with_metrics(mut self, metrics: Arc<MetricsAggregator>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the event loop and the expiry ticker
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Configuration` if the service was already
    /// started once.
    pub async fn start(&self) -> BrokerResult<()> {
        let mut receiver = self.receiver.lock().await.take().ok_or_else(|| {
            BrokerError::Configuration("discovery service already started".to_string())
        })?;

        let registry = Arc::clone(&self.registry);
        let metrics = self.metrics.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    envelope = receiver.recv() => {
                        let Some(envelope) = envelope else { break };
                        apply_event(&registry, metrics.as_deref(), envelope.event);
                        if let Some(applied) = envelope.applied {
                            let _ = applied.send(());
                        }
                    }
                }
            }
            debug!("Discovery event loop stopped");
        });

        let sender = self.sender.clone();
        let interval = self.expire_check_interval;
        let mut stop_rx = self.stop_tx.subscribe();
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticks.tick() => {
                        let envelope = Envelope { event: ServiceEvent::Expire, applied: None };
                        if sender.send(envelope).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Discovery expiry ticker stopped");
        });

        self.tasks.lock().await.extend([event_loop, ticker]);
        self.running.store(true, Ordering::SeqCst);
        info!(
            expire_check_interval = ?self.expire_check_interval,
            threshold = ?self.registry.expired_threshold(),
            "Discovery service started"
        );
        Ok(())
    }

    /// Stop and join both tasks
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Discovery task ended abnormally");
            }
        }
        info!("Discovery service stopped");
    }

    /// Apply an event, through the event loop when running
    pub async fn publish(&self, event: ServiceEvent) {
        if !self.is_running() {
            apply_event(&self.registry, self.metrics.as_deref(), event);
            return;
        }

        let (applied_tx, applied_rx) = oneshot::channel();
        let envelope = Envelope {
            event,
            applied: Some(applied_tx),
        };
        match self.sender.send(envelope).await {
            Ok(()) => {
                let _ = applied_rx.await;
            }
            Err(mpsc::error::SendError(envelope)) => {
                apply_event(&self.registry, self.metrics.as_deref(), envelope.event);
            }
        }
    }

    /// Handle a consumer registration
    pub async fn register(&self, address: &str, port: u16, pipe_names: &str) -> RegisterResponse {
        let bindings = ClientInformation::parse_bindings(pipe_names);
        if address.trim().is_empty() || port == 0 || bindings.is_empty() {
            warn!(
                address = %address,
                port,
                pipe_names = %pipe_names,
                "Rejected registration"
            );
            return RegisterResponse {
                client_id: None,
                status: RpcStatus::Rejected,
            };
        }

        let client = ClientInformation::new(address, port, bindings);
        let client_id = client.client_id();
        self.publish(ServiceEvent::Register(vec![client])).await;

        RegisterResponse {
            client_id: Some(client_id),
            status: RpcStatus::Ok,
        }
    }

    /// Handle a consumer heartbeat
    pub async fn heartbeat(&self, address: &str, port: u16) -> HeartbeatResponse {
        if address.trim().is_empty() || port == 0 {
            return HeartbeatResponse {
                status: RpcStatus::Rejected,
            };
        }

        let client = ClientInformation::new(address, port, Vec::new());
        self.publish(ServiceEvent::HeartBeat(vec![client])).await;
        HeartbeatResponse {
            status: RpcStatus::Ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ClientStatus;
    use crate::types::ClientId;

    fn service(interval: Duration) -> DiscoveryService {
        let registry = Arc::new(ClientRegistry::new(Duration::from_millis(100)));
        DiscoveryService::new(registry, interval)
    }

    #[tokio::test]
    async fn test_register_before_start_applies_inline() {
        let service = service(Duration::from_secs(5));
        let response = service.register("10.0.0.1", 7000, "orders,billing").await;
        assert_eq!(response.status, RpcStatus::Ok);
        assert_eq!(
            response.client_id,
            Some(ClientId::new("10.0.0.1", 7000))
        );
        assert!(service.registry().lookup("billing").is_some());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let service = service(Duration::from_secs(5));
        assert_eq!(
            service.register("", 7000, "orders").await.status,
            RpcStatus::Rejected
        );
        assert_eq!(
            service.register("h", 0, "orders").await.status,
            RpcStatus::Rejected
        );
        assert_eq!(
            service.register("h", 7000, " , ").await.status,
            RpcStatus::Rejected
        );
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_running_service_applies_before_returning() {
        let service = service(Duration::from_secs(5));
        service.start().await.unwrap();

        service.register("h", 1, "orders").await;
        assert!(service.registry().lookup("orders").is_some());

        assert_eq!(service.heartbeat("h", 1).await.status, RpcStatus::Ok);
        service.stop().await;
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_expiry_ticker_marks_silent_clients_offline() {
        let service = service(Duration::from_millis(20));
        service.start().await.unwrap();
        service.register("h", 1, "orders").await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        let client = service.registry().get(&ClientId::new("h", 1)).unwrap();
        assert_eq!(client.status, ClientStatus::Offline);

        service.heartbeat("h", 1).await;
        assert!(service.registry().lookup("orders").is_some());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_expiry_drops_activity_of_offline_clients() {
        let metrics = Arc::new(MetricsAggregator::new(Default::default()));
        let service = service(Duration::from_secs(5)).with_metrics(Arc::clone(&metrics));
        let silent = ClientId::new("h", 1);
        let fresh = ClientId::new("h", 2);

        service.register("h", 1, "orders").await;
        metrics.record_client_activity(&silent, 4, 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        service.register("h", 2, "orders").await;
        metrics.record_client_activity(&fresh, 1, 0);

        service.publish(ServiceEvent::Expire).await;
        assert!(metrics.client_activity(&silent).is_none());
        assert_eq!(metrics.client_activity(&fresh).unwrap().succeeded_messages, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let service = service(Duration::from_secs(5));
        service.start().await.unwrap();
        assert!(matches!(
            service.start().await,
            Err(BrokerError::Configuration(_))
        ));
        service.stop().await;
    }
}
