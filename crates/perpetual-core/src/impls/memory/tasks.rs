use async_trait::async_trait;

use super::InMemoryRecordStore;
use crate::domain::{PerpetualTaskId, PerpetualTaskRecord, StoreError};
use crate::ports::{InsertOutcome, TaskFilter, TaskStore, TaskUpdate};

#[async_trait]
impl TaskStore for InMemoryRecordStore {
    async fn insert(&self, record: PerpetualTaskRecord) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id.to_string()));
        }
        tasks.insert(record.id, record);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        unique: &TaskFilter,
        record: PerpetualTaskRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let existing = tasks
            .values()
            .filter(|r| unique.matches(r))
            .min_by_key(|r| (r.created_at, r.id))
            .cloned();
        if let Some(existing) = existing {
            return Ok(InsertOutcome::Existing(existing));
        }
        if tasks.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id.to_string()));
        }
        tasks.insert(record.id, record);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: PerpetualTaskId) -> Result<Option<PerpetualTaskRecord>, StoreError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn find_one(&self, filter: &TaskFilter) -> Result<Option<PerpetualTaskRecord>, StoreError> {
        let tasks = self.tasks.lock().await;
        Ok(tasks
            .values()
            .filter(|r| filter.matches(r))
            .min_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Vec<PerpetualTaskRecord>, StoreError> {
        let tasks = self.tasks.lock().await;
        let mut found: Vec<PerpetualTaskRecord> =
            tasks.values().filter(|r| filter.matches(r)).cloned().collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        Ok(found)
    }

    async fn update(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let mut affected = 0;
        for record in tasks.values_mut().filter(|r| filter.matches(r)) {
            update.apply(record);
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&self, filter: &TaskFilter) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, r| !filter.matches(r));
        Ok((before - tasks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClientContext, DelegateId, NewPerpetualTask, TaskState};
    use crate::ports::Patch;
    use ulid::Ulid;

    fn record(account: &str, created_at: i64) -> PerpetualTaskRecord {
        let spec = NewPerpetualTask::new(account, "watch", ClientContext::client_id("c"));
        PerpetualTaskRecord::new(PerpetualTaskId::from_ulid(Ulid::new()), spec, created_at)
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let store = InMemoryRecordStore::new();
        let r = record("acc", 0);

        store.insert(r.clone()).await.unwrap();
        let err = store.insert(r).await.unwrap_err();

        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_the_first_record() {
        let store = InMemoryRecordStore::new();
        let first = record("acc", 0);
        let second = record("acc", 5);
        let unique = TaskFilter {
            client_context: Some(ClientContext::client_id("c")),
            ..TaskFilter::by_account("acc")
        };

        assert_eq!(
            store.insert_if_absent(&unique, first.clone()).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&unique, second.clone()).await.unwrap(),
            InsertOutcome::Existing(first.clone())
        );
        assert!(store.get(second.id).await.unwrap().is_none());

        let elsewhere = TaskFilter::by_account("other");
        assert_eq!(
            store.insert_if_absent(&elsewhere, second).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn find_returns_oldest_first() {
        let store = InMemoryRecordStore::new();
        let late = record("acc", 20);
        let early = record("acc", 10);
        store.insert(late.clone()).await.unwrap();
        store.insert(early.clone()).await.unwrap();

        let found = store.find(&TaskFilter::by_account("acc")).await.unwrap();

        assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![early.id, late.id]);
        let one = store.find_one(&TaskFilter::by_account("acc")).await.unwrap();
        assert_eq!(one.map(|r| r.id), Some(early.id));
    }

    #[tokio::test]
    async fn conditional_update_reports_zero_when_state_differs() {
        let store = InMemoryRecordStore::new();
        let r = record("acc", 0);
        store.insert(r.clone()).await.unwrap();

        let filter = TaskFilter::by_id(r.id).in_states([TaskState::Assigned]);
        let update = TaskUpdate {
            last_heartbeat: Some(Patch::Set(99)),
            ..TaskUpdate::default()
        };

        assert_eq!(store.update(&filter, &update).await.unwrap(), 0);
        assert_eq!(store.get(r.id).await.unwrap().unwrap().last_heartbeat, None);
    }

    #[tokio::test]
    async fn update_many_touches_only_matches() {
        let store = InMemoryRecordStore::new();
        let mut mine = record("acc", 0);
        mine.state = TaskState::Assigned;
        mine.delegate_id = Some(DelegateId::new("d-1"));
        let other = record("acc", 1);
        store.insert(mine.clone()).await.unwrap();
        store.insert(other.clone()).await.unwrap();

        let filter = TaskFilter {
            delegate_id: Some(DelegateId::new("d-1")),
            ..TaskFilter::default()
        };
        let update = TaskUpdate {
            state: Some(TaskState::ToRebalance),
            delegate_id: Some(Patch::Unset),
            ..TaskUpdate::default()
        };

        assert_eq!(store.update(&filter, &update).await.unwrap(), 1);
        assert_eq!(store.get(other.id).await.unwrap().unwrap().state, TaskState::Unassigned);
    }

    #[tokio::test]
    async fn delete_by_account() {
        let store = InMemoryRecordStore::new();
        store.insert(record("a", 0)).await.unwrap();
        store.insert(record("a", 1)).await.unwrap();
        store.insert(record("b", 2)).await.unwrap();

        assert_eq!(store.delete(&TaskFilter::by_account("a")).await.unwrap(), 2);
        assert_eq!(store.find(&TaskFilter::default()).await.unwrap().len(), 1);
    }
}
