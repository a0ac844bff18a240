//! Dead letter sink
//!
//! Parks messages whose retries are exhausted under the pipe's
//! `P_dead_letter` key with a TTL. All operations are best effort: store
//! failures are logged and a default is returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::message::Message;
use crate::retry::MessageRetryRecord;
use crate::store::DurableStore;
use crate::types::PipeName;

/// A permanently failed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub message: Message,
    pub failure_reason: String,
    pub retry_attempts: u32,
    pub failure_time: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_retry_record(record: &MessageRetryRecord) -> Self {
        Self {
            message: record.message.clone(),
            failure_reason: record.last_status.clone(),
            retry_attempts: record.retry_count,
            failure_time: Utc::now(),
        }
    }
}

/// Dead letter storage over the durable store
pub struct DeadLetterSink {
    store: Arc<dyn DurableStore>,
    total_added: AtomicU64,
}

impl DeadLetterSink {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            total_added: AtomicU64::new(0),
        }
    }

    /// Park a message; `false` if the store refused it
    pub async fn send(&self, pipe: &PipeName, record: &MessageRetryRecord, ttl: Duration) -> bool {
        let dead_letter = DeadLetterRecord::from_retry_record(record);
        let raw = match serde_json::to_string(&dead_letter) {
            Ok(raw) => raw,
            Err(e) => {
                error!(pipe = %pipe, message_id = %record.message_id, error = %e, "Failed to encode dead letter");
                return false;
            }
        };

        match self.store.add_expiring(&pipe.dead_letter_key(), raw, ttl).await {
            Ok(()) => {
                self.total_added.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pipe = %pipe,
                    message_id = %record.message_id,
                    retry_attempts = record.retry_count,
                    reason = %record.last_status,
                    "Message moved to dead letter queue"
                );
                true
            }
            Err(e) => {
                error!(pipe = %pipe, message_id = %record.message_id, error = %e, "Failed to store dead letter");
                false
            }
        }
    }

    /// Live records, oldest first
    pub async fn list_messages(&self, pipe: &PipeName, limit: usize) -> Vec<DeadLetterRecord> {
        match self.store.list_expiring(&pipe.dead_letter_key(), limit).await {
            Ok(raws) => raws
                .iter()
                .filter_map(|raw| match serde_json::from_str(raw) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(pipe = %pipe, error = %e, "Skipping undecodable dead letter");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                error!(pipe = %pipe, error = %e, "Failed to list dead letters");
                Vec::new()
            }
        }
    }

    pub async fn size(&self, pipe: &PipeName) -> usize {
        match self.store.count_expiring(&pipe.dead_letter_key()).await {
            Ok(n) => n,
            Err(e) => {
                error!(pipe = %pipe, error = %e, "Failed to count dead letters");
                0
            }
        }
    }

    /// Remove the record of one message
    pub async fn remove(&self, pipe: &PipeName, message_id: &str) -> bool {
        let key = pipe.dead_letter_key();
        let raws = match self.store.list_expiring(&key, usize::MAX).await {
            Ok(raws) => raws,
            Err(e) => {
                error!(pipe = %pipe, error = %e, "Failed to list dead letters");
                return false;
            }
        };

        let target = raws.into_iter().find(|raw| {
            serde_json::from_str::<DeadLetterRecord>(raw)
                .is_ok_and(|record| record.message.id == message_id)
        });
        let Some(raw) = target else {
            return false;
        };

        match self.store.remove_expiring(&key, &raw).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(pipe = %pipe, message_id = %message_id, error = %e, "Failed to remove dead letter");
                false
            }
        }
    }

    /// Drop every record of a pipe
    pub async fn clear(&self, pipe: &PipeName) -> bool {
        match self.store.delete(&pipe.dead_letter_key()).await {
            Ok(()) => {
                info!(pipe = %pipe, "Dead letter queue cleared");
                true
            }
            Err(e) => {
                error!(pipe = %pipe, error = %e, "Failed to clear dead letters");
                false
            }
        }
    }

    /// Records written since start
    pub fn total_added(&self) -> u64 {
        self.total_added.load(Ordering::Relaxed)
    }
}
