//! QueuePublisher: typed sends into one queue's topics.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::topic::TopicScope;
use crate::domain::scheduling::duration_ms;
use crate::domain::{MessageId, QueueError, QueueMessage};
use crate::ports::{Clock, IdGenerator, QueueStore};

pub struct QueuePublisher<T> {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    scope: TopicScope,
    retries: u32,
    ttl: Duration,
    _payload: PhantomData<fn(T)>,
}

impl<T: Serialize> QueuePublisher<T> {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        scope: TopicScope,
        retries: u32,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            scope,
            retries,
            ttl,
            _payload: PhantomData,
        }
    }

    pub fn scope(&self) -> &TopicScope {
        &self.scope
    }

    /// Send to the queue's base topic.
    pub async fn send(&self, payload: T) -> Result<MessageId, QueueError> {
        self.send_with_context::<&str>(&[], payload, BTreeMap::new()).await
    }

    pub async fn send_to<S: AsRef<str>>(&self, elements: &[S], payload: T) -> Result<MessageId, QueueError> {
        self.send_with_context(elements, payload, BTreeMap::new()).await
    }

    /// Send with a context blob the consumer sees in its message span.
    pub async fn send_with_context<S: AsRef<str>>(
        &self,
        elements: &[S],
        payload: T,
        global_context: BTreeMap<String, String>,
    ) -> Result<MessageId, QueueError> {
        let now = self.clock.now_millis();
        let message = QueueMessage {
            id: self.ids.generate_message_id(),
            topic: self.scope.topic_for(elements),
            earliest_get: now,
            valid_until: now.saturating_add(duration_ms(self.ttl)),
            retries: self.retries,
            payload,
            global_context,
            created_at: now,
        };
        let stored = message.encode()?;
        let id = stored.id;
        debug!(message_id = %id, topic = %stored.topic, retries = stored.retries, "message published");
        self.store.insert(stored).await?;
        Ok(id)
    }
}
