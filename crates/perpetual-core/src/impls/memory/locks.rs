use async_trait::async_trait;

use super::InMemoryRecordStore;
use crate::domain::{LockRecord, StoreError};
use crate::ports::{LockRequest, LockStore, TryLockOutcome};

#[async_trait]
impl LockStore for InMemoryRecordStore {
    async fn try_lock(&self, request: LockRequest) -> Result<TryLockOutcome, StoreError> {
        let mut locks = self.locks.lock().await;
        let record = locks.entry(request.name.clone()).or_insert_with(|| LockRecord {
            name: request.name.clone(),
            owner: None,
            acquired_at_monotonic: request.now_monotonic,
            inactive_timeout: request.inactive_timeout,
            ephemeral: request.ephemeral,
        });

        if record.is_held(request.now_monotonic) {
            return Ok(TryLockOutcome::Busy);
        }

        let outcome = match record.owner {
            Some(previous_owner) => TryLockOutcome::AcquiredAbandoned { previous_owner },
            None => TryLockOutcome::Acquired,
        };
        record.owner = Some(request.owner);
        record.acquired_at_monotonic = request.now_monotonic;
        record.inactive_timeout = request.inactive_timeout;
        record.ephemeral = request.ephemeral;
        Ok(outcome)
    }

    async fn unlock(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        let mut locks = self.locks.lock().await;
        let Some(record) = locks.get_mut(name) else {
            return Ok(None);
        };
        if !record.is_locked() {
            return Ok(None);
        }
        let before = record.clone();
        record.owner = None;
        Ok(Some(before))
    }

    async fn get(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        Ok(self.locks.lock().await.get(name).cloned())
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.locks.lock().await.remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::LockOwnerId;
    use ulid::Ulid;

    fn request(name: &str, at_secs: u64) -> LockRequest {
        LockRequest {
            name: name.to_string(),
            owner: LockOwnerId::from_ulid(Ulid::new()),
            now_monotonic: Duration::from_secs(at_secs),
            inactive_timeout: Duration::from_secs(5),
            ephemeral: false,
        }
    }

    #[tokio::test]
    async fn second_caller_is_busy_until_expiry() {
        let store = InMemoryRecordStore::new();
        let first = request("foo", 0);
        let first_owner = first.owner;

        assert_eq!(store.try_lock(first).await.unwrap(), TryLockOutcome::Acquired);
        assert_eq!(store.try_lock(request("foo", 4)).await.unwrap(), TryLockOutcome::Busy);
        assert_eq!(
            store.try_lock(request("foo", 6)).await.unwrap(),
            TryLockOutcome::AcquiredAbandoned {
                previous_owner: first_owner
            }
        );
    }

    #[tokio::test]
    async fn unlock_twice_reports_not_locked() {
        let store = InMemoryRecordStore::new();
        store.try_lock(request("foo", 0)).await.unwrap();

        assert!(store.unlock("foo").await.unwrap().is_some());
        assert!(store.unlock("foo").await.unwrap().is_none());
        assert!(store.get("foo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = InMemoryRecordStore::new();
        store.try_lock(request("foo", 0)).await.unwrap();

        assert!(store.delete("foo").await.unwrap());
        assert!(!store.delete("foo").await.unwrap());
        assert!(store.get("foo").await.unwrap().is_none());
    }
}
