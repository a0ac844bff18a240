//! Messages, the pipe codec and the RPC wire bodies
//!
//! - [`Message`]: one unit of work travelling through a pipe
//! - [`MessageCodec`]: how a message is laid down in the durable store
//! - [`RequestIdGenerator`]: ids stamped on every dispatch request
//! - [`RequestBody`] / [`ResponseBody`]: the consumer RPC exchange

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};
use crate::types::{ClientId, PipeName};

/// A message stored in a pipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier, stable across retries
    pub id: String,
    /// Opaque payload (base64 encoded in JSON)
    #[serde(with = "base64_serde")]
    pub payload: Vec<u8>,
    /// Producer supplied headers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// When the producer created the message
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            headers: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a message with a caller-chosen id
    pub fn with_id(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            ..Self::new(payload)
        }
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

mod base64_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            bytes,
        ))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
            .map_err(serde::de::Error::custom)
    }
}

/// Encodes messages into the string form kept by the durable store
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &Message) -> BrokerResult<String>;

    fn decode(&self, raw: &str) -> BrokerResult<Message>;
}

/// JSON codec (default)
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &Message) -> BrokerResult<String> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(&self, raw: &str) -> BrokerResult<Message> {
        serde_json::from_str(raw).map_err(|e| BrokerError::Serialization(e.to_string()))
    }
}

/// Produces request ids for dispatch calls
pub trait RequestIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random UUIDv4 request ids (default)
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidRequestIdGenerator;

impl RequestIdGenerator for UuidRequestIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// `prefix-N` request ids, useful when correlating logs by hand
#[derive(Debug)]
pub struct SequentialRequestIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialRequestIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl RequestIdGenerator for SequentialRequestIdGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

/// Batch shipped to a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub request_id: String,
    pub client_id: ClientId,
    pub pipe_name: PipeName,
    pub messages: Vec<Message>,
}

/// Consumer verdict on a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Consumer reply
///
/// `success_count` is the number of messages, counted from the head of the
/// batch, that the consumer processed and that may be removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub request_id: String,
    pub status: ResponseStatus,
    pub success_count: usize,
}

impl ResponseBody {
    pub fn success(request_id: impl Into<String>, success_count: usize) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Success,
            success_count,
        }
    }

    pub fn error(request_id: impl Into<String>, success_count: usize) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Error,
            success_count,
        }
    }
}

/// Status returned by registration RPCs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcStatus {
    Ok,
    Rejected,
}

/// Consumer registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub address: String,
    pub port: u16,
    /// Comma separated pipe names or patterns
    pub pipe_names: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub client_id: Option<ClientId>,
    pub status: RpcStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub status: RpcStatus,
}
