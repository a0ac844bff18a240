//! Cross-component delivery guarantees over a shared in-memory store

use async_trait::async_trait;
use mpipe::{
    BatchResult, Broker, BrokerError, ClientId, ClientInformation, ClientRegistry, ConsumerTransport,
    DeadLetterSink, DurableStore, InMemoryStore, Message, MessagePipeConfiguration,
    MetricsAggregator, MetricsThresholds, Pipe, PipeDistributor, PipeManager, PipeName,
    RequestBody, ResponseBody, RetryScheduler, SendOutcome, ServerConfiguration, ServiceEvent,
    TransportError,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consumer that confirms everything and remembers what it saw
#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<String>>,
}

impl Recording {
    fn ids(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsumerTransport for Recording {
    async fn message_processing(
        &self,
        _client: &ClientInformation,
        request: &RequestBody,
    ) -> Result<ResponseBody, TransportError> {
        self.seen
            .lock()
            .unwrap()
            .extend(request.messages.iter().map(|m| m.id.clone()));
        Ok(ResponseBody::success(
            &request.request_id,
            request.messages.len(),
        ))
    }

    fn invalidate(&self, _client_id: &ClientId) {}
}

/// Consumer that fails every message it is given
struct AlwaysFails;

#[async_trait]
impl ConsumerTransport for AlwaysFails {
    async fn message_processing(
        &self,
        _client: &ClientInformation,
        request: &RequestBody,
    ) -> Result<ResponseBody, TransportError> {
        Ok(ResponseBody::error(&request.request_id, 0))
    }

    fn invalidate(&self, _client_id: &ClientId) {}
}

fn fast_pipes() -> MessagePipeConfiguration {
    MessagePipeConfiguration::new()
        .with_monitor_interval(Duration::from_millis(20))
        .with_lock_wait(Duration::from_millis(200))
}

fn pipe_on(
    store: &Arc<dyn DurableStore>,
    name: &str,
    config: MessagePipeConfiguration,
) -> Arc<Pipe> {
    Arc::new(Pipe::new(
        PipeName::parse(name).unwrap(),
        Arc::clone(store),
        Arc::new(config),
        Arc::new(MetricsAggregator::new(MetricsThresholds::default())),
    ))
}

async fn wait_until_empty(pipe: &Pipe) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipe.size().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue did not drain");
}

#[tokio::test]
async fn test_take_lock_admits_one_handler_across_processes() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
    // Two pipe instances over one store stand in for two broker processes
    let node_a = pipe_on(&store, "orders", fast_pipes());
    let node_b = pipe_on(&store, "orders", fast_pipes());

    for i in 0..40 {
        assert!(node_a.put(Message::with_id(format!("m-{}", i), "x")).await);
    }

    let in_flight = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(Mutex::new(Vec::new()));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let pipe = if i % 2 == 0 {
                Arc::clone(&node_a)
            } else {
                Arc::clone(&node_b)
            };
            let in_flight = Arc::clone(&in_flight);
            let overlaps = Arc::clone(&overlaps);
            let handled = Arc::clone(&handled);
            tokio::spawn(async move {
                while pipe.size().await > 0 {
                    let in_flight = Arc::clone(&in_flight);
                    let overlaps = Arc::clone(&overlaps);
                    let handled = Arc::clone(&handled);
                    pipe.lock_handle_first(move |message| async move {
                        if in_flight.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        handled.lock().unwrap().push(message.id);
                        in_flight.store(false, Ordering::SeqCst);
                        Ok(true)
                    })
                    .await;
                }
            })
        })
        .collect();
    for worker in futures::future::join_all(workers).await {
        worker.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let handled = handled.lock().unwrap().clone();
    assert_eq!(handled.len(), 40);
    let unique: HashSet<_> = handled.iter().collect();
    assert_eq!(unique.len(), 40);
    assert_eq!(handled[0], "m-0");
}

#[tokio::test]
async fn test_declined_or_failed_handler_keeps_message() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
    let pipe = pipe_on(&store, "orders", fast_pipes());
    assert!(pipe.put(Message::with_id("m-1", "x")).await);

    assert!(!pipe.lock_handle_first(|_| async { Ok(false) }).await);
    assert_eq!(pipe.size().await, 1);

    assert!(
        !pipe
            .lock_handle_first(|_| async {
                Err(BrokerError::Transport(TransportError::Unavailable(
                    "down".into(),
                )))
            })
            .await
    );
    assert_eq!(pipe.size().await, 1);
    assert_eq!(pipe.peek().await.unwrap().id, "m-1");

    assert!(pipe.lock_handle_first(|_| async { Ok(true) }).await);
    assert_eq!(pipe.size().await, 0);
}

#[tokio::test]
async fn test_exhausted_retries_end_in_dead_letters() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
    let pipe = pipe_on(&store, "orders", fast_pipes().with_max_retries(2));

    let registry = Arc::new(ClientRegistry::new(Duration::from_secs(30)));
    registry.apply(ServiceEvent::Register(vec![ClientInformation::new(
        "10.0.0.1",
        7000,
        vec!["orders".to_string()],
    )]));
    let dead_letters = Arc::new(DeadLetterSink::new(Arc::clone(&store)));
    let retry = Arc::new(RetryScheduler::new(Arc::clone(&dead_letters)));
    let distributor = PipeDistributor::new(
        Arc::clone(&pipe),
        registry,
        Arc::new(AlwaysFails),
        Arc::clone(&retry),
        Arc::new(MetricsAggregator::new(MetricsThresholds::default())),
    );

    let message = Message::with_id("m-1", "payload");
    for attempt in 1..=2 {
        let outcome = distributor.send_message_batch(vec![message.clone()]).await;
        assert_eq!(outcome, SendOutcome::Processed(1));
        assert_eq!(retry.record("m-1").unwrap().retry_count, attempt);
    }

    let outcome = distributor.send_message_batch(vec![message.clone()]).await;
    assert_eq!(outcome, SendOutcome::Processed(1));
    assert!(retry.record("m-1").is_none());

    let letters = dead_letters.list_messages(pipe.name(), 10).await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message.id, "m-1");
    assert_eq!(letters[0].retry_attempts, 2);
    assert_eq!(dead_letters.size(pipe.name()).await, 1);
}

fn failing_distributor(
    pipe: &Arc<Pipe>,
    dead_letters: &Arc<DeadLetterSink>,
) -> (PipeDistributor, Arc<RetryScheduler>) {
    let registry = Arc::new(ClientRegistry::new(Duration::from_secs(30)));
    registry.apply(ServiceEvent::Register(vec![ClientInformation::new(
        "10.0.0.1",
        7000,
        vec!["orders".to_string()],
    )]));
    let retry = Arc::new(RetryScheduler::new(Arc::clone(dead_letters)));
    let distributor = PipeDistributor::new(
        Arc::clone(pipe),
        registry,
        Arc::new(AlwaysFails),
        Arc::clone(&retry),
        Arc::new(MetricsAggregator::new(MetricsThresholds::default())),
    );
    (distributor, retry)
}

#[tokio::test]
async fn test_retry_count_is_shared_between_brokers() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
    // The dead letter horizon caps each backoff at 100ms
    let config = fast_pipes()
        .with_max_retries(2)
        .with_dlq_ttl(Duration::from_millis(100));
    let node_a = pipe_on(&store, "orders", config.clone());
    let node_b = pipe_on(&store, "orders", config);
    let dead_letters = Arc::new(DeadLetterSink::new(Arc::clone(&store)));
    let (broker_a, retry_a) = failing_distributor(&node_a, &dead_letters);
    let (broker_b, retry_b) = failing_distributor(&node_b, &dead_letters);

    assert!(node_a.put(Message::with_id("m-1", "x")).await);

    let rounds: [(&Arc<Pipe>, &PipeDistributor); 3] =
        [(&node_a, &broker_a), (&node_b, &broker_b), (&node_a, &broker_a)];
    for (round, (pipe, distributor)) in rounds.into_iter().enumerate() {
        if round > 0 {
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        let result = pipe
            .lock_handle_batch(10, |batch| async move {
                distributor.send_message_batch(batch).await.removable()
            })
            .await;
        assert_eq!(result, BatchResult::Removed(1));
    }

    let letters = dead_letters.list_messages(node_a.name(), 10).await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].retry_attempts, 2);
    assert_eq!(store.delayed_size("orders_retry").await.unwrap(), 0);
    assert!(retry_a.record("m-1").is_none());

    // Broker B never saw the outcome; its record goes quiet and is swept
    assert_eq!(retry_b.record("m-1").unwrap().retry_count, 2);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(retry_b.sweep_stale(Duration::ZERO), 1);
    assert_eq!(retry_b.pending(), 0);
}

fn manager_over(
    store: Arc<dyn DurableStore>,
    registry: Arc<ClientRegistry>,
    transport: Arc<dyn ConsumerTransport>,
) -> PipeManager {
    let server = ServerConfiguration {
        pipe_idle_threshold_secs: 0,
        ..ServerConfiguration::default()
    };
    PipeManager::new(
        &server,
        Arc::clone(&store),
        registry,
        transport,
        Arc::new(RetryScheduler::new(Arc::new(DeadLetterSink::new(store)))),
        Arc::new(MetricsAggregator::new(MetricsThresholds::default())),
    )
    .unwrap()
    .with_default_configuration(fast_pipes())
}

#[tokio::test]
async fn test_reaped_pipe_is_revived_by_arrival() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
    let registry = Arc::new(ClientRegistry::new(Duration::from_secs(30)));
    let consumer = Arc::new(Recording::default());
    let manager = manager_over(Arc::clone(&store), Arc::clone(&registry), consumer.clone());

    assert!(manager.put("orders", Message::with_id("m-1", "x")).await.unwrap());
    let first = manager.get_message_pipe("orders").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let reaped = manager.reap_idle().await;
    assert_eq!(reaped, vec![PipeName::parse("orders").unwrap()]);
    assert!(manager.is_empty());
    assert!(first.is_scheduler_stopped());
    assert_eq!(store.size("orders.queue").await.unwrap(), 1);

    let revived = manager.get_message_pipe("orders").await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&first, &revived));
    assert_eq!(revived.size().await, 1);

    registry.apply(ServiceEvent::Register(vec![ClientInformation::new(
        "10.0.0.1",
        7000,
        vec!["orders".to_string()],
    )]));
    manager.on_message_arrived("orders.queue").await;
    wait_until_empty(&revived).await;
    assert_eq!(consumer.ids(), vec!["m-1".to_string()]);
    manager.stop().await;
}

#[tokio::test]
async fn test_two_brokers_share_one_queue_without_duplicates() {
    let store = Arc::new(InMemoryStore::new());
    let consumer = Arc::new(Recording::default());

    let mut brokers = Vec::new();
    for _ in 0..2 {
        let broker = Broker::builder()
            .store(store.clone())
            .transport(consumer.clone())
            .pipe_configuration(fast_pipes().with_batch_size(3))
            .build()
            .unwrap();
        broker.start().await.unwrap();
        broker.register("10.0.0.1", 7000, "orders").await;
        brokers.push(broker);
    }

    for i in 0..30 {
        let broker = &brokers[i % 2];
        assert!(
            broker
                .put("orders", Message::with_id(format!("m-{}", i), "x"))
                .await
                .unwrap()
        );
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while brokers[0].pipe_size("orders").await.unwrap() != Some(0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue did not drain");

    let ids = consumer.ids();
    assert_eq!(ids.len(), 30);
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 30);

    for broker in &brokers {
        broker.stop().await;
    }
}
