//! JSON-over-HTTP consumer transport

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use super::{ConsumerTransport, TransportError};
use crate::discovery::ClientInformation;
use crate::message::{RequestBody, ResponseBody};
use crate::types::ClientId;

/// Path every consumer serves batches on
pub const MESSAGE_PROCESSING_PATH: &str = "/message-processing";

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Connect timeout for a fresh channel
    pub connect_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// URL scheme, `http` unless consumers terminate TLS
    pub scheme: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            scheme: "http".to_string(),
        }
    }
}

/// Posts batches to `{scheme}://{address}:{port}/message-processing`
///
/// One `reqwest::Client` (with its connection pool) is cached per consumer
/// and dropped on [`ConsumerTransport::invalidate`].
pub struct HttpTransport {
    config: HttpTransportConfig,
    channels: DashMap<ClientId, reqwest::Client>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(HttpTransportConfig::default())
    }
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
        }
    }

    /// Number of cached channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn channel(&self, client_id: &ClientId) -> Result<reqwest::Client, TransportError> {
        if let Some(client) = self.channels.get(client_id) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        debug!(client = %client_id, "Opened consumer channel");
        self.channels.insert(client_id.clone(), client.clone());
        Ok(client)
    }

    fn url(&self, client: &ClientInformation) -> String {
        format!(
            "{}://{}:{}{}",
            self.config.scheme, client.address, client.port, MESSAGE_PROCESSING_PATH
        )
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::DeadlineExceeded(err.to_string())
    } else if err.is_connect() || err.is_request() {
        TransportError::Unavailable(err.to_string())
    } else if err.is_decode() {
        TransportError::Malformed(err.to_string())
    } else {
        TransportError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl ConsumerTransport for HttpTransport {
    async fn message_processing(
        &self,
        client: &ClientInformation,
        request: &RequestBody,
    ) -> Result<ResponseBody, TransportError> {
        let channel = self.channel(&client.client_id())?;

        let response = channel
            .post(self.url(client))
            .json(request)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected(format!(
                "consumer replied {}",
                status
            )));
        }

        let body = response.bytes().await.map_err(classify)?;
        serde_json::from_slice(&body).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    fn invalidate(&self, client_id: &ClientId) {
        if self.channels.remove(client_id).is_some() {
            debug!(client = %client_id, "Invalidated consumer channel");
        }
    }
}
