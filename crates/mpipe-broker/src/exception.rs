//! Exception handler hook for swallowed per-message failures

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

use crate::error::BrokerError;
use crate::message::Message;
use crate::types::PipeName;

/// Where a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStatus {
    /// Writing to the pipe failed; the message was not stored
    PutException,
    /// Handing a message to a consumer failed
    SendException,
    /// No ONLINE consumer is bound to the pipe
    NoHealthClient,
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStatus::PutException => write!(f, "PUT_EXCEPTION"),
            FailureStatus::SendException => write!(f, "SEND_EXCEPTION"),
            FailureStatus::NoHealthClient => write!(f, "NO_HEALTH_CLIENT"),
        }
    }
}

/// Receives failures that pipes and distributors do not propagate
pub trait ExceptionHandler: Send + Sync {
    fn handle(
        &self,
        pipe: &PipeName,
        message: Option<&Message>,
        status: FailureStatus,
        error: &BrokerError,
    );
}

/// Default handler: one log line per failure
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle(
        &self,
        pipe: &PipeName,
        message: Option<&Message>,
        status: FailureStatus,
        err: &BrokerError,
    ) {
        let message_id = message.map(|m| m.id.as_str()).unwrap_or("-");
        match status {
            FailureStatus::NoHealthClient => {
                warn!(pipe = %pipe, status = %status, error = %err, "No consumer available");
            }
            _ => {
                error!(
                    pipe = %pipe,
                    message_id = %message_id,
                    status = %status,
                    error = %err,
                    "Pipe operation failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(FailureStatus::PutException.to_string(), "PUT_EXCEPTION");
        assert_eq!(
            serde_json::to_string(&FailureStatus::NoHealthClient).unwrap(),
            "\"NO_HEALTH_CLIENT\""
        );
    }

    #[test]
    fn test_logging_handler_accepts_missing_message() {
        let pipe = PipeName::parse("orders").unwrap();
        LoggingExceptionHandler.handle(
            &pipe,
            None,
            FailureStatus::NoHealthClient,
            &BrokerError::NoHealthyClient("orders".into()),
        );
    }
}
