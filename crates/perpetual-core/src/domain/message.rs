//! Queue message ("queuable") model.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ids::MessageId;

/// A message in the lease queue.
///
/// # Visibility
/// A message can be handed out only while `earliest_get <= now` and
/// `now < valid_until`. Leasing, heartbeats and delayed requeues all work by
/// pushing `earliest_get` into the future.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage<T> {
    pub id: MessageId,
    pub topic: String,
    pub earliest_get: i64,
    /// Undelivered messages are purged after this instant (epoch ms).
    pub valid_until: i64,
    /// Remaining delivery attempts after the current one.
    pub retries: u32,
    pub payload: T,
    /// Context propagated from the publisher (trace ids, principal, ...).
    #[serde(default)]
    pub global_context: BTreeMap<String, String>,
    pub created_at: i64,
}

/// The form messages are persisted in: payload kept as JSON.
pub type StoredMessage = QueueMessage<serde_json::Value>;

impl<T> QueueMessage<T> {
    pub fn is_visible(&self, now_ms: i64) -> bool {
        self.earliest_get <= now_ms && !self.is_expired(now_ms)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.valid_until <= now_ms
    }

    fn with_payload<U>(self, payload: U) -> QueueMessage<U> {
        QueueMessage {
            id: self.id,
            topic: self.topic,
            earliest_get: self.earliest_get,
            valid_until: self.valid_until,
            retries: self.retries,
            payload,
            global_context: self.global_context,
            created_at: self.created_at,
        }
    }
}

impl<T: Serialize> QueueMessage<T> {
    pub fn encode(self) -> Result<StoredMessage, serde_json::Error> {
        let payload = serde_json::to_value(&self.payload)?;
        Ok(self.with_payload(payload))
    }
}

impl StoredMessage {
    pub fn decode<T: DeserializeOwned>(self) -> Result<QueueMessage<T>, serde_json::Error> {
        let payload = serde_json::from_value(self.payload.clone())?;
        Ok(self.with_payload(payload))
    }
}

/// Which messages to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFilter {
    All,
    /// Currently invisible: leased, or requeued with a delay.
    Running,
    /// Visible now.
    NotRunning,
}

impl QueueFilter {
    pub fn matches<T>(self, message: &QueueMessage<T>, now_ms: i64) -> bool {
        match self {
            QueueFilter::All => true,
            QueueFilter::Running => message.earliest_get > now_ms,
            QueueFilter::NotRunning => message.earliest_get <= now_ms,
        }
    }
}
