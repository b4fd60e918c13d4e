//! QueueStore port: persisted queue messages.
//!
//! # Design
//! - `lease_next` is a find-and-modify: pick the oldest visible message on one
//!   of the given topics and push its `earliest_get` to `lease_until` in the
//!   same step. The pushed timestamp is the lease.
//! - Messages are stored with a JSON payload; typing happens in the consumer.

use async_trait::async_trait;

use crate::domain::{MessageId, QueueFilter, StoreError, StoredMessage};

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, message: StoredMessage) -> Result<(), StoreError>;

    /// Lease the next visible message, ordered by `earliest_get` then insertion.
    async fn lease_next(
        &self,
        topics: &[String],
        now_ms: i64,
        lease_until_ms: i64,
    ) -> Result<Option<StoredMessage>, StoreError>;

    /// Set `earliest_get` of a message. Returns whether it still exists.
    async fn extend_lease(&self, id: MessageId, until_ms: i64) -> Result<bool, StoreError>;

    /// Set remaining retries and visibility. Returns whether it still exists.
    async fn requeue(&self, id: MessageId, retries: u32, earliest_get_ms: i64) -> Result<bool, StoreError>;

    async fn delete(&self, id: MessageId) -> Result<bool, StoreError>;

    async fn count(&self, topics: &[String], filter: QueueFilter, now_ms: i64) -> Result<u64, StoreError>;

    /// Drop every message whose `valid_until` has passed.
    async fn purge_expired(&self, now_ms: i64) -> Result<u64, StoreError>;
}
