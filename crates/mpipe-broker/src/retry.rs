//! Retry scheduling with exponential backoff
//!
//! A message the consumer failed is parked in the pipe's `P_retry` delayed
//! queue; the store moves it back to the ready queue once due, so no timer
//! is owned here. After `max_retries` attempts it goes to the dead letter
//! sink instead.
//!
//! The attempt count travels with the parked message in the
//! [`RETRY_COUNT_HEADER`] header, so whichever broker sees the next failure
//! continues the count. Local records only add failure timestamps and are
//! swept once they go quiet.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::dlq::DeadLetterSink;
use crate::error::BrokerResult;
use crate::message::Message;
use crate::pipe::Pipe;

const BASE_RETRY_DELAY_MILLIS: u64 = 1000;

/// Header carrying how many retries a message has already been scheduled for
pub const RETRY_COUNT_HEADER: &str = "mpipe-retry-count";

fn attempts_carried(message: &Message) -> u32 {
    message
        .header(RETRY_COUNT_HEADER)
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}

/// Failure history of one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRetryRecord {
    pub message_id: String,
    pub message: Message,
    pub retry_count: u32,
    pub max_retries: u32,
    pub first_failure_time: DateTime<Utc>,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub last_status: String,
}

impl MessageRetryRecord {
    pub fn new(message: Message, max_retries: u32, status: impl Into<String>) -> Self {
        Self {
            message_id: message.id.clone(),
            message,
            retry_count: 0,
            max_retries,
            first_failure_time: Utc::now(),
            last_retry_time: None,
            last_status: status.into(),
        }
    }

    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// `1000 * 2^retry_count` milliseconds, saturating
    pub fn retry_delay_millis(&self) -> u64 {
        2u64.checked_pow(self.retry_count)
            .and_then(|factor| factor.checked_mul(BASE_RETRY_DELAY_MILLIS))
            .unwrap_or(u64::MAX)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_millis())
    }

    fn last_activity(&self) -> DateTime<Utc> {
        self.last_retry_time.unwrap_or(self.first_failure_time)
    }
}

/// What happened to a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Parked for redelivery after the delay
    Scheduled(Duration),
    /// Retries exhausted; stored as a dead letter
    DeadLettered,
    /// Could not be moved; it must stay in the queue
    Failed,
}

impl RetryDecision {
    /// Whether the message left the ready queue's custody
    pub fn moved(&self) -> bool {
        !matches!(self, RetryDecision::Failed)
    }
}

/// Tracks retry records and routes failed messages
pub struct RetryScheduler {
    records: DashMap<String, MessageRetryRecord>,
    dead_letters: Arc<DeadLetterSink>,
}

impl RetryScheduler {
    pub fn new(dead_letters: Arc<DeadLetterSink>) -> Self {
        Self {
            records: DashMap::new(),
            dead_letters,
        }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        &self.dead_letters
    }

    /// Park `message` in the pipe's delayed queue as retry number `attempt`
    pub async fn schedule_retry(
        &self,
        pipe: &Pipe,
        message: &Message,
        attempt: u32,
        delay: Duration,
    ) -> BrokerResult<()> {
        let parked = message
            .clone()
            .with_header(RETRY_COUNT_HEADER, attempt.to_string());
        let raw = pipe.config().codec.encode(&parked)?;
        pipe.store()
            .offer_delayed(&pipe.name().retry_key(), raw, delay)
            .await
    }

    /// Retry or dead-letter a message the consumer failed
    pub async fn handle_failure(
        &self,
        pipe: &Pipe,
        message: &Message,
        reason: &str,
    ) -> RetryDecision {
        let mut record = self
            .records
            .get(&message.id)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| {
                MessageRetryRecord::new(message.clone(), pipe.config().max_retries, reason)
            });
        record.message = message.clone();
        record.last_status = reason.to_string();
        record.retry_count = record.retry_count.max(attempts_carried(message));

        if record.should_retry() {
            // Never parked beyond the dead letter horizon
            let delay = record.retry_delay().min(pipe.config().dlq_ttl);
            let attempt = record.retry_count + 1;
            match self.schedule_retry(pipe, message, attempt, delay).await {
                Ok(()) => {
                    record.retry_count = attempt;
                    record.last_retry_time = Some(Utc::now());
                    debug!(
                        pipe = %pipe.name(),
                        message_id = %message.id,
                        attempt = record.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Retry scheduled"
                    );
                    self.records.insert(message.id.clone(), record);
                    RetryDecision::Scheduled(delay)
                }
                Err(e) => {
                    error!(pipe = %pipe.name(), message_id = %message.id, error = %e, "Failed to schedule retry");
                    self.records.insert(message.id.clone(), record);
                    RetryDecision::Failed
                }
            }
        } else if self
            .dead_letters
            .send(pipe.name(), &record, pipe.config().dlq_ttl)
            .await
        {
            self.records.remove(&message.id);
            RetryDecision::DeadLettered
        } else {
            self.records.insert(message.id.clone(), record);
            RetryDecision::Failed
        }
    }

    /// Forget the history of delivered messages
    pub fn acknowledge<'a>(&self, message_ids: impl IntoIterator<Item = &'a str>) {
        for id in message_ids {
            if self.records.remove(id).is_some() {
                debug!(message_id = %id, "Retried message delivered");
            }
        }
    }

    pub fn record(&self, message_id: &str) -> Option<MessageRetryRecord> {
        self.records.get(message_id).map(|r| r.value().clone())
    }

    /// Messages with an open retry history
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    /// Drop records with no failure or retry for longer than `ttl`
    ///
    /// Covers messages another broker delivered or dead-lettered. Returns
    /// how many records were dropped.
    pub fn sweep_stale(&self, ttl: Duration) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return 0;
        };
        let before = self.records.len();
        self.records.retain(|_, record| record.last_activity() >= cutoff);
        let swept = before.saturating_sub(self.records.len());
        if swept > 0 {
            debug!(swept, "Stale retry records dropped");
        }
        swept
    }
}
