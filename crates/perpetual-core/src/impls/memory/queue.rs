use async_trait::async_trait;

use super::{InMemoryRecordStore, QueuedEntry};
use crate::domain::{MessageId, QueueFilter, StoreError, StoredMessage};
use crate::ports::QueueStore;

#[async_trait]
impl QueueStore for InMemoryRecordStore {
    async fn insert(&self, message: StoredMessage) -> Result<(), StoreError> {
        let mut queue = self.queue.lock().await;
        if queue.messages.contains_key(&message.id) {
            return Err(StoreError::Duplicate(message.id.to_string()));
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.messages.insert(message.id, QueuedEntry { seq, message });
        Ok(())
    }

    async fn lease_next(
        &self,
        topics: &[String],
        now_ms: i64,
        lease_until_ms: i64,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let mut queue = self.queue.lock().await;
        let next = queue
            .messages
            .values_mut()
            .filter(|e| topics.contains(&e.message.topic) && e.message.is_visible(now_ms))
            .min_by_key(|e| (e.message.earliest_get, e.seq));

        Ok(next.map(|entry| {
            entry.message.earliest_get = lease_until_ms;
            entry.message.clone()
        }))
    }

    async fn extend_lease(&self, id: MessageId, until_ms: i64) -> Result<bool, StoreError> {
        let mut queue = self.queue.lock().await;
        Ok(match queue.messages.get_mut(&id) {
            Some(entry) => {
                entry.message.earliest_get = until_ms;
                true
            }
            None => false,
        })
    }

    async fn requeue(&self, id: MessageId, retries: u32, earliest_get_ms: i64) -> Result<bool, StoreError> {
        let mut queue = self.queue.lock().await;
        Ok(match queue.messages.get_mut(&id) {
            Some(entry) => {
                entry.message.retries = retries;
                entry.message.earliest_get = earliest_get_ms;
                true
            }
            None => false,
        })
    }

    async fn delete(&self, id: MessageId) -> Result<bool, StoreError> {
        Ok(self.queue.lock().await.messages.remove(&id).is_some())
    }

    async fn count(&self, topics: &[String], filter: QueueFilter, now_ms: i64) -> Result<u64, StoreError> {
        let queue = self.queue.lock().await;
        Ok(queue
            .messages
            .values()
            .filter(|e| topics.contains(&e.message.topic) && filter.matches(&e.message, now_ms))
            .count() as u64)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64, StoreError> {
        let mut queue = self.queue.lock().await;
        let before = queue.messages.len();
        queue.messages.retain(|_, e| !e.message.is_expired(now_ms));
        Ok((before - queue.messages.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::QueueMessage;
    use ulid::Ulid;

    fn message(topic: &str, earliest_get: i64) -> StoredMessage {
        QueueMessage {
            id: MessageId::from_ulid(Ulid::new()),
            topic: topic.to_string(),
            earliest_get,
            valid_until: 10_000,
            retries: 1,
            payload: serde_json::json!({}),
            global_context: BTreeMap::new(),
            created_at: 0,
        }
    }

    fn topics(t: &[&str]) -> Vec<String> {
        t.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn lease_hides_message_until_lease_ends() {
        let store = InMemoryRecordStore::new();
        let m = message("t", 0);
        store.insert(m.clone()).await.unwrap();

        let leased = store.lease_next(&topics(&["t"]), 100, 600).await.unwrap().unwrap();
        assert_eq!(leased.id, m.id);
        assert_eq!(leased.earliest_get, 600);

        assert!(store.lease_next(&topics(&["t"]), 599, 1_000).await.unwrap().is_none());
        assert!(store.lease_next(&topics(&["t"]), 600, 1_000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lease_prefers_oldest_visible_then_insertion() {
        let store = InMemoryRecordStore::new();
        let first = message("t", 50);
        let second = message("t", 50);
        let earliest = message("t", 10);
        store.insert(first.clone()).await.unwrap();
        store.insert(second.clone()).await.unwrap();
        store.insert(earliest.clone()).await.unwrap();

        let order: Vec<MessageId> = {
            let mut ids = Vec::new();
            while let Some(m) = store.lease_next(&topics(&["t"]), 100, 5_000).await.unwrap() {
                ids.push(m.id);
            }
            ids
        };

        assert_eq!(order, vec![earliest.id, first.id, second.id]);
    }

    #[tokio::test]
    async fn lease_respects_topics() {
        let store = InMemoryRecordStore::new();
        store.insert(message("a", 0)).await.unwrap();

        assert!(store.lease_next(&topics(&["b"]), 100, 200).await.unwrap().is_none());
        assert!(store.lease_next(&topics(&["b", "a"]), 100, 200).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn counts_and_purge() {
        let store = InMemoryRecordStore::new();
        let mut expired = message("t", 0);
        expired.valid_until = 50;
        store.insert(expired).await.unwrap();
        store.insert(message("t", 500)).await.unwrap();
        let t = topics(&["t"]);

        assert_eq!(store.count(&t, QueueFilter::All, 100).await.unwrap(), 2);
        assert_eq!(store.count(&t, QueueFilter::Running, 100).await.unwrap(), 1);
        assert_eq!(store.count(&t, QueueFilter::NotRunning, 100).await.unwrap(), 1);

        assert_eq!(store.purge_expired(100).await.unwrap(), 1);
        assert_eq!(store.count(&t, QueueFilter::All, 100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_and_delete_missing_report_false() {
        let store = InMemoryRecordStore::new();
        let id = MessageId::from_ulid(Ulid::new());
        assert!(!store.requeue(id, 0, 0).await.unwrap());
        assert!(!store.extend_lease(id, 0).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
    }
}
