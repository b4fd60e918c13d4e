//! QueueConsumer: typed view over the [`QueueStore`] for one set of topics.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::scheduling::duration_ms;
use crate::domain::{MessageId, QueueError, QueueFilter, QueueMessage};
use crate::observability::QueueCounts;
use crate::ports::{Clock, QueueStore};

/// QueueConsumer は 1 組の topic に対する型付きの読み出し口
///
/// `get` で取得したメッセージは lease 中（`earliest_get` が未来）になり、
/// `ack` / `requeue` されるまで他の consumer には見えない。
pub struct QueueConsumer<T> {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    topics: Vec<String>,
    heartbeat: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> QueueConsumer<T> {
    /// `heartbeat` is the lease length: a leased message stays invisible
    /// this long unless the lease is extended.
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        topics: Vec<String>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            topics,
            heartbeat,
            _payload: PhantomData,
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Lease the next visible message, polling every `poll` for up to `wait`.
    ///
    /// A message whose payload does not decode is deleted before the
    /// [`QueueError::Poison`] is returned.
    pub async fn get(&self, wait: Duration, poll: Duration) -> Result<Option<QueueMessage<T>>, QueueError> {
        let deadline = Instant::now() + wait;
        let poll = poll.max(Duration::from_millis(1));
        loop {
            let now = self.clock.now_millis();
            let leased = self
                .store
                .lease_next(&self.topics, now, self.lease_until(now))
                .await?;

            if let Some(stored) = leased {
                let id = stored.id;
                return match stored.decode::<T>() {
                    Ok(message) => {
                        debug!(message_id = %id, topic = %message.topic, "message leased");
                        Ok(Some(message))
                    }
                    Err(source) => {
                        self.store.delete(id).await?;
                        warn!(message_id = %id, error = %source, "undecodable message acked");
                        Err(QueueError::Poison { id, source })
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Push the lease of `id` one heartbeat past now. `false` if the message is gone.
    pub async fn extend_lease(&self, id: MessageId) -> Result<bool, QueueError> {
        let until = self.lease_until(self.clock.now_millis());
        Ok(self.store.extend_lease(id, until).await?)
    }

    /// [`Self::extend_lease`] that also refreshes the caller's copy.
    pub async fn update_heartbeat(&self, message: &mut QueueMessage<T>) -> Result<bool, QueueError> {
        let until = self.lease_until(self.clock.now_millis());
        let extended = self.store.extend_lease(message.id, until).await?;
        if extended {
            message.earliest_get = until;
        }
        Ok(extended)
    }

    pub async fn ack(&self, id: MessageId) -> Result<bool, QueueError> {
        Ok(self.store.delete(id).await?)
    }

    /// Make the message visible again right away with `retries` left.
    pub async fn requeue(&self, id: MessageId, retries: u32) -> Result<bool, QueueError> {
        self.requeue_at(id, retries, self.clock.now_millis()).await
    }

    pub async fn requeue_at(&self, id: MessageId, retries: u32, earliest_get_ms: i64) -> Result<bool, QueueError> {
        Ok(self.store.requeue(id, retries, earliest_get_ms).await?)
    }

    pub async fn count(&self, filter: QueueFilter) -> Result<u64, QueueError> {
        Ok(self
            .store
            .count(&self.topics, filter, self.clock.now_millis())
            .await?)
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(QueueCounts {
            queued: self.count(QueueFilter::NotRunning).await?,
            running: self.count(QueueFilter::Running).await?,
        })
    }

    /// Delete messages past their `valid_until`, on every topic.
    pub async fn purge_expired(&self) -> Result<u64, QueueError> {
        Ok(self.store.purge_expired(self.clock.now_millis()).await?)
    }

    fn lease_until(&self, now_ms: i64) -> i64 {
        now_ms.saturating_add(duration_ms(self.heartbeat))
    }
}
