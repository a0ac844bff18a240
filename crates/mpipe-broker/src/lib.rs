//! # mpipe broker
//!
//! Server-side distribution engine for mpipe message pipes.
//!
//! Pipes are named FIFO queues in a shared durable store. Producers append
//! to them; the broker locks each pipe, ships batches from its head to one
//! healthy consumer at a time and removes what the consumer confirmed.
//!
//! ## Features
//!
//! - **Cross-process exclusion**: put/take locks with lease expiry in the store
//! - **Consumer registry**: pattern bindings, health tracking, load balancing
//! - **Batch dispatch**: partial success, exclusion of unreachable consumers
//! - **Retry and dead letters**: exponential backoff, TTL-bound dead letter queue
//! - **Lifecycle**: lazy pipe creation, recovery from the store, idle reaping
//! - **Metrics**: per-pipe health buckets and per-client activity
//!
//! ## Example
//!
//! ```rust,no_run
//! use mpipe_broker::{Broker, Message};
//! # use mpipe_broker::{ClientInformation, ConsumerTransport, RequestBody, ResponseBody, TransportError, ClientId};
//! # use std::sync::Arc;
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl ConsumerTransport for MyTransport {
//! #     async fn message_processing(&self, _: &ClientInformation, r: &RequestBody)
//! #         -> Result<ResponseBody, TransportError> {
//! #         Ok(ResponseBody::success(&r.request_id, r.messages.len()))
//! #     }
//! #     fn invalidate(&self, _: &ClientId) {}
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::builder()
//!         .transport(Arc::new(MyTransport))
//!         .build()?;
//!     broker.start().await?;
//!
//!     broker.register("10.0.0.7", 7000, "orders,billing\\..*").await;
//!     broker.put("orders", Message::new("hello")).await?;
//!
//!     broker.stop().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod discovery;
pub mod distributor;
pub mod dlq;
pub mod error;
pub mod exception;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod pipe;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;

pub use broker::{Broker, BrokerBuilder};
pub use config::{MessagePipeConfiguration, MetricsThresholds, ServerConfiguration};
pub use discovery::{
    ClientInformation, ClientRegistry, ClientStatus, DiscoveryService, LoadBalanceNode,
    LoadBalanceStrategy, RoundRobinStrategy, ServiceEvent, WeightedRandomStrategy,
};
pub use distributor::{PipeDistributor, RetainReason, SendOutcome};
pub use dlq::{DeadLetterRecord, DeadLetterSink};
pub use error::{BrokerError, BrokerResult};
pub use exception::{ExceptionHandler, FailureStatus, LoggingExceptionHandler};
pub use manager::{PipeHandle, PipeManager};
pub use message::{
    HeartbeatRequest, HeartbeatResponse, JsonCodec, Message, MessageCodec, RegisterRequest,
    RegisterResponse, RequestBody, RequestIdGenerator, ResponseBody, ResponseStatus, RpcStatus,
    SequentialRequestIdGenerator, UuidRequestIdGenerator,
};
pub use metrics::{ClientActivity, ClusterReport, MetricsAggregator, PipeHealth, PipeMetrics};
pub use pipe::{BatchResult, Pipe};
pub use retry::{MessageRetryRecord, RETRY_COUNT_HEADER, RetryDecision, RetryScheduler};
pub use scheduler::{PipeScheduler, SchedulerState};
pub use store::{ArrivalStream, DurableStore, InMemoryStore, LockToken};
pub use transport::{ConsumerTransport, TransportError};
pub use types::{ClientId, NameValidationError, PipeName};

#[cfg(feature = "redis")]
pub use store::{RedisStore, RedisStoreConfig};

#[cfg(feature = "http")]
pub use transport::{HttpTransport, HttpTransportConfig};
