//! Per-pipe batch dispatch to consumers

use std::sync::Arc;
use tracing::{debug, warn};

use crate::discovery::{ClientInformation, ClientRegistry};
use crate::error::BrokerError;
use crate::exception::FailureStatus;
use crate::message::{Message, RequestBody, ResponseBody, ResponseStatus};
use crate::metrics::MetricsAggregator;
use crate::pipe::Pipe;
use crate::retry::RetryScheduler;
use crate::transport::{ConsumerTransport, TransportError};
use crate::types::ClientId;

/// Why a batch stays at the head of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainReason {
    NoHealthyClient,
    TransportFailure,
    MalformedResponse,
}

/// Result of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// This many messages from the head may be removed
    Processed(usize),
    /// Remove nothing; try again on the next wake
    Retained(RetainReason),
}

impl SendOutcome {
    /// How many head messages to remove, `None` to keep the batch
    pub fn removable(&self) -> Option<usize> {
        match self {
            SendOutcome::Processed(n) => Some(*n),
            SendOutcome::Retained(_) => None,
        }
    }
}

/// Ships batches of one pipe to its consumers
pub struct PipeDistributor {
    pipe: Arc<Pipe>,
    registry: Arc<ClientRegistry>,
    transport: Arc<dyn ConsumerTransport>,
    retry: Arc<RetryScheduler>,
    metrics: Arc<MetricsAggregator>,
}

impl PipeDistributor {
    pub fn new(
        pipe: Arc<Pipe>,
        registry: Arc<ClientRegistry>,
        transport: Arc<dyn ConsumerTransport>,
        retry: Arc<RetryScheduler>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            pipe,
            registry,
            transport,
            retry,
            metrics,
        }
    }

    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    /// Pick a healthy consumer with the pipe's strategy, or the registry's
    pub fn resolve_client(&self) -> Option<ClientInformation> {
        let name = self.pipe.name().as_str();
        match &self.pipe.config().load_balance {
            Some(strategy) => self.registry.lookup_with(name, strategy.as_ref()),
            None => self.registry.lookup(name),
        }
    }

    pub fn has_healthy_client(&self) -> bool {
        self.registry.check_have_health_client(self.pipe.name().as_str())
    }

    /// Dispatch `messages` (head of the queue, in order) to one consumer
    pub async fn send_message_batch(&self, messages: Vec<Message>) -> SendOutcome {
        if messages.is_empty() {
            return SendOutcome::Processed(0);
        }

        let Some(client) = self.resolve_client() else {
            self.pipe.config().exception_handler.handle(
                self.pipe.name(),
                messages.first(),
                FailureStatus::NoHealthClient,
                &BrokerError::NoHealthyClient(self.pipe.name().to_string()),
            );
            return SendOutcome::Retained(RetainReason::NoHealthyClient);
        };

        let client_id = client.client_id();
        let config = self.pipe.config();
        let request = RequestBody {
            request_id: config.request_id_generator.next_id(),
            client_id: client_id.clone(),
            pipe_name: self.pipe.name().clone(),
            messages,
        };

        debug!(
            pipe = %self.pipe.name(),
            client = %client_id,
            request_id = %request.request_id,
            batch = request.messages.len(),
            "Dispatching batch"
        );

        let call = self.transport.message_processing(&client, &request);
        let response = match tokio::time::timeout(config.request_timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return self.transport_failed(&client_id, &request, e),
            Err(_) => {
                let e = TransportError::DeadlineExceeded(format!(
                    "no reply within {:?}",
                    config.request_timeout
                ));
                return self.transport_failed(&client_id, &request, e);
            }
        };

        if let Err(e) = validate_response(&request, &response) {
            return self.transport_failed(&client_id, &request, e);
        }

        self.interpret(&client_id, &request, response).await
    }

    async fn interpret(
        &self,
        client_id: &ClientId,
        request: &RequestBody,
        response: ResponseBody,
    ) -> SendOutcome {
        let total = request.messages.len();
        let confirmed = response.success_count;
        self.retry.acknowledge(
            request.messages[..confirmed]
                .iter()
                .map(|m| m.id.as_str()),
        );

        match response.status {
            ResponseStatus::Success => {
                self.metrics
                    .record_client_activity(client_id, confirmed, total - confirmed);
                SendOutcome::Processed(confirmed)
            }
            ResponseStatus::Error => {
                self.metrics
                    .record_client_activity(client_id, confirmed, total - confirmed);
                let Some(failed) = request.messages.get(confirmed) else {
                    return SendOutcome::Processed(confirmed);
                };

                let reason = format!("consumer {} returned ERROR", client_id);
                let decision = self.retry.handle_failure(&self.pipe, failed, &reason).await;
                debug!(
                    pipe = %self.pipe.name(),
                    message_id = %failed.id,
                    decision = ?decision,
                    "Consumer reported failure"
                );
                if decision.moved() {
                    SendOutcome::Processed(confirmed + 1)
                } else {
                    SendOutcome::Processed(confirmed)
                }
            }
        }
    }

    fn transport_failed(
        &self,
        client_id: &ClientId,
        request: &RequestBody,
        err: TransportError,
    ) -> SendOutcome {
        let reason = match err {
            TransportError::Malformed(_) => RetainReason::MalformedResponse,
            _ => RetainReason::TransportFailure,
        };

        if err.is_exclusion_worthy() {
            self.registry.exclude(client_id);
            self.transport.invalidate(client_id);
        } else {
            warn!(
                pipe = %self.pipe.name(),
                client = %client_id,
                error = %err,
                "Consumer call failed"
            );
        }

        self.metrics
            .record_client_activity(client_id, 0, request.messages.len());
        self.pipe.config().exception_handler.handle(
            self.pipe.name(),
            request.messages.first(),
            FailureStatus::SendException,
            &BrokerError::Transport(err),
        );
        SendOutcome::Retained(reason)
    }
}

fn validate_response(request: &RequestBody, response: &ResponseBody) -> Result<(), TransportError> {
    if response.request_id != request.request_id {
        return Err(TransportError::Malformed(format!(
            "reply for request '{}' answered '{}'",
            request.request_id, response.request_id
        )));
    }
    if response.success_count > request.messages.len() {
        return Err(TransportError::Malformed(format!(
            "success count {} exceeds batch of {}",
            response.success_count,
            request.messages.len()
        )));
    }
    Ok(())
}
