//! Error types for broker operations

use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur inside the distribution engine
///
/// Only [`BrokerError::Configuration`] is meant to surface to callers at
/// construction time. Every other variant is caught at component
/// boundaries and turned into a log line, an exception-handler call, a
/// retry or a dead-letter write.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Invalid port, name, pattern or missing collaborator
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The pipe-count ceiling has been reached
    #[error("Pipe capacity exceeded: limit is {limit} pipes")]
    CapacityExceeded { limit: usize },

    /// No ONLINE client is bound to the pipe
    #[error("No healthy client for pipe '{0}'")]
    NoHealthyClient(String),

    /// Load balancing was asked to choose among zero candidates
    #[error("Load balance candidate list is empty")]
    EmptyCandidates,

    /// RPC to a consumer failed
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Lock or queue backend failure
    #[error("Store failure: {0}")]
    Store(String),

    /// The backing store has been shut down
    #[error("Store is shut down")]
    StoreShutdown,

    /// Message encoding or decoding failed
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A pipe name or client id failed validation
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl BrokerError {
    /// Shorthand for store failures
    pub fn store(err: impl std::fmt::Display) -> Self {
        BrokerError::Store(err.to_string())
    }

    /// Whether the error is caused by the backing store
    pub fn is_store_failure(&self) -> bool {
        matches!(self, BrokerError::Store(_) | BrokerError::StoreShutdown)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<regex::Error> for BrokerError {
    fn from(err: regex::Error) -> Self {
        BrokerError::Configuration(format!("invalid pattern: {}", err))
    }
}
