//! RPC boundary to consumer processes

use async_trait::async_trait;
use thiserror::Error;

use crate::discovery::ClientInformation;
use crate::message::{RequestBody, ResponseBody};
use crate::types::ClientId;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{HttpTransport, HttpTransportConfig};

/// Failures of a single consumer call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Consumer could not be reached (connection refused, reset, DNS)
    #[error("Consumer unavailable: {0}")]
    Unavailable(String),

    /// Call did not complete in time
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Reply could not be understood or does not belong to the request
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Consumer answered with a refusal
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether the consumer should be excluded from load balancing
    pub fn is_exclusion_worthy(&self) -> bool {
        matches!(
            self,
            TransportError::Unavailable(_) | TransportError::DeadlineExceeded(_)
        )
    }
}

/// Client side of the `messageProcessing` call
#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    /// Ship a batch to `client` and wait for its verdict
    async fn message_processing(
        &self,
        client: &ClientInformation,
        request: &RequestBody,
    ) -> Result<ResponseBody, TransportError>;

    /// Drop any cached connection to `client_id`
    fn invalidate(&self, client_id: &ClientId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_worthy() {
        assert!(TransportError::Unavailable("refused".into()).is_exclusion_worthy());
        assert!(TransportError::DeadlineExceeded("10s".into()).is_exclusion_worthy());
        assert!(!TransportError::Malformed("bad json".into()).is_exclusion_worthy());
        assert!(!TransportError::Rejected("503".into()).is_exclusion_worthy());
    }
}
