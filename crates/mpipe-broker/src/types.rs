//! Core identifiers: pipe names and client ids
//!
//! A pipe's durable resources are addressed purely by its name, so every
//! broker process sharing a store derives the same keys for the same pipe.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error type for name validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameValidationError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name is {length} bytes, longer than the {max} allowed")]
    TooLong { length: usize, max: usize },
    #[error("name cannot have leading or trailing whitespace")]
    LeadingTrailingWhitespace,
    #[error(
        "name can only contain alphanumeric characters, hyphens, underscores, colons and dots"
    )]
    InvalidCharacters,
    #[error("client id must look like 'address::port'")]
    MalformedClientId,
}

impl From<(String, NameValidationError)> for crate::BrokerError {
    fn from((name, reason): (String, NameValidationError)) -> Self {
        crate::BrokerError::InvalidName {
            name,
            reason: reason.to_string(),
        }
    }
}

const QUEUE_SUFFIX: &str = ".queue";
const TAKE_LOCK_SUFFIX: &str = ".take.lock";
const PUT_LOCK_SUFFIX: &str = ".put.lock";
const RETRY_SUFFIX: &str = "_retry";
const DEAD_LETTER_SUFFIX: &str = "_dead_letter";

/// Name of a message pipe
///
/// Valid names are non-empty, at most [`PipeName::MAX_LENGTH`] bytes long,
/// carry no surrounding whitespace and use only alphanumerics, `-`, `_`,
/// `:` and `.`.
///
/// # Examples
///
/// ```
/// use mpipe_broker::PipeName;
///
/// let pipe = PipeName::parse("orders.created").unwrap();
/// assert_eq!(pipe.queue_key(), "orders.created.queue");
/// assert_eq!(pipe.take_lock_key(), "orders.created.take.lock");
/// assert!(PipeName::parse("orders/created").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PipeName(String);

impl PipeName {
    /// Longest accepted name, leaving room for the key suffixes
    pub const MAX_LENGTH: usize = 200;

    /// Parse and validate a pipe name
    pub fn parse(name: impl AsRef<str>) -> Result<Self, NameValidationError> {
        let s = name.as_ref();

        if s.is_empty() {
            return Err(NameValidationError::Empty);
        }

        if s.len() > Self::MAX_LENGTH {
            return Err(NameValidationError::TooLong {
                length: s.len(),
                max: Self::MAX_LENGTH,
            });
        }

        if s != s.trim() {
            return Err(NameValidationError::LeadingTrailingWhitespace);
        }

        if !s
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(NameValidationError::InvalidCharacters);
        }

        Ok(Self(s.to_string()))
    }

    /// Recover a pipe name from its queue key (`P.queue` -> `P`)
    pub fn from_queue_key(key: &str) -> Option<Self> {
        key.strip_suffix(QUEUE_SUFFIX)
            .and_then(|name| Self::parse(name).ok())
    }

    /// Glob matching every pipe queue key in the store
    pub fn queue_key_pattern() -> &'static str {
        "*.queue"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the FIFO queue
    pub fn queue_key(&self) -> String {
        format!("{}{}", self.0, QUEUE_SUFFIX)
    }

    /// Key of the lock serializing consumption
    pub fn take_lock_key(&self) -> String {
        format!("{}{}", self.0, TAKE_LOCK_SUFFIX)
    }

    /// Key of the lock serializing production
    pub fn put_lock_key(&self) -> String {
        format!("{}{}", self.0, PUT_LOCK_SUFFIX)
    }

    /// Key of the delayed retry queue
    pub fn retry_key(&self) -> String {
        format!("{}{}", self.0, RETRY_SUFFIX)
    }

    /// Key of the dead-letter record set
    pub fn dead_letter_key(&self) -> String {
        format!("{}{}", self.0, DEAD_LETTER_SUFFIX)
    }
}

impl FromStr for PipeName {
    type Err = NameValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PipeName {
    type Error = NameValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<PipeName> for String {
    fn from(name: PipeName) -> Self {
        name.0
    }
}

impl AsRef<str> for PipeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a consumer process: `address::port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Build the id for a consumer listening on `address:port`
    pub fn new(address: &str, port: u16) -> Self {
        Self(format!("{}::{}", address, port))
    }

    /// Parse an id of the form `address::port`
    pub fn parse(id: impl AsRef<str>) -> Result<Self, NameValidationError> {
        let s = id.as_ref();
        if s.is_empty() {
            return Err(NameValidationError::Empty);
        }
        let (address, port) = s
            .rsplit_once("::")
            .ok_or(NameValidationError::MalformedClientId)?;
        if address.is_empty() || port.parse::<u16>().is_err() {
            return Err(NameValidationError::MalformedClientId);
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn address(&self) -> &str {
        self.0.rsplit_once("::").map(|(a, _)| a).unwrap_or(&self.0)
    }

    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once("::")
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or_default()
    }
}

impl TryFrom<String> for ClientId {
    type Error = NameValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_name_parse_valid() {
        assert!(PipeName::parse("orders").is_ok());
        assert!(PipeName::parse("orders.created").is_ok());
        assert!(PipeName::parse("tenant:42_events-v2").is_ok());
    }

    #[test]
    fn test_pipe_name_parse_invalid() {
        assert_eq!(PipeName::parse(""), Err(NameValidationError::Empty));
        assert_eq!(
            PipeName::parse(" orders"),
            Err(NameValidationError::LeadingTrailingWhitespace)
        );
        assert_eq!(
            PipeName::parse("orders/created"),
            Err(NameValidationError::InvalidCharacters)
        );
        assert_eq!(
            PipeName::parse("orders*"),
            Err(NameValidationError::InvalidCharacters)
        );
    }

    #[test]
    fn test_pipe_name_length_limit() {
        let longest = "p".repeat(PipeName::MAX_LENGTH);
        assert!(PipeName::parse(&longest).is_ok());

        let too_long = "p".repeat(PipeName::MAX_LENGTH + 1);
        assert_eq!(
            PipeName::parse(&too_long),
            Err(NameValidationError::TooLong {
                length: PipeName::MAX_LENGTH + 1,
                max: PipeName::MAX_LENGTH,
            })
        );
        assert_eq!(
            NameValidationError::Empty.to_string(),
            "name cannot be empty"
        );
    }

    #[test]
    fn test_key_layout() {
        let pipe = PipeName::parse("billing").unwrap();
        assert_eq!(pipe.queue_key(), "billing.queue");
        assert_eq!(pipe.take_lock_key(), "billing.take.lock");
        assert_eq!(pipe.put_lock_key(), "billing.put.lock");
        assert_eq!(pipe.retry_key(), "billing_retry");
        assert_eq!(pipe.dead_letter_key(), "billing_dead_letter");
    }

    #[test]
    fn test_from_queue_key() {
        let pipe = PipeName::from_queue_key("orders.created.queue").unwrap();
        assert_eq!(pipe.as_str(), "orders.created");
        assert!(PipeName::from_queue_key("orders.take.lock").is_none());
        assert!(PipeName::from_queue_key(".queue").is_none());
    }

    #[test]
    fn test_client_id() {
        let id = ClientId::new("10.0.0.7", 9090);
        assert_eq!(id.as_str(), "10.0.0.7::9090");
        assert_eq!(id.address(), "10.0.0.7");
        assert_eq!(id.port(), 9090);

        let parsed = ClientId::parse("consumer-a::7000").unwrap();
        assert_eq!(parsed.port(), 7000);
    }

    #[test]
    fn test_client_id_invalid() {
        assert!(ClientId::parse("").is_err());
        assert!(ClientId::parse("host:80").is_err());
        assert!(ClientId::parse("::80").is_err());
        assert!(ClientId::parse("host::notaport").is_err());
    }

    #[test]
    fn test_pipe_name_serde() {
        let pipe = PipeName::parse("a.b").unwrap();
        let json = serde_json::to_string(&pipe).unwrap();
        assert_eq!(json, "\"a.b\"");
        let back: PipeName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pipe);
        assert!(serde_json::from_str::<PipeName>("\"a b\"").is_err());
    }
}
