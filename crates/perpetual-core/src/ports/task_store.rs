//! TaskStore port: persistence for perpetual task records.
//!
//! # Design
//! - Writes are conditional: an update names a [`TaskFilter`] and reports how
//!   many records matched. Zero affected is how callers learn that ownership
//!   moved under them.
//! - Updates are declarative ([`TaskUpdate`]) so a document or SQL backend can
//!   translate them into a single atomic statement.
//! - Create-or-lookup is a single atomic [`TaskStore::insert_if_absent`]; a
//!   backend maps it onto a unique index or an upsert.
//! - No caching: every call reads the current stored state.

use async_trait::async_trait;

use crate::domain::{
    ClientContext, DelegateId, PerpetualTaskId, PerpetualTaskRecord, SchedulingVector, StoreError,
    TaskState, UnassignedReason,
};

/// Field-level write for optional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch<T> {
    Set(T),
    Unset,
}

impl<T> Patch<T> {
    fn apply(self, field: &mut Option<T>) {
        *field = match self {
            Patch::Set(v) => Some(v),
            Patch::Unset => None,
        };
    }
}

impl<T> From<Option<T>> for Patch<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Unset,
        }
    }
}

/// Selects records. Every populated field must match.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub id: Option<PerpetualTaskId>,
    pub account_id: Option<String>,
    pub task_type: Option<String>,
    pub client_context: Option<ClientContext>,
    pub delegate_id: Option<DelegateId>,
    /// Empty means any state.
    pub states: Vec<TaskState>,
    /// Only records whose [`PerpetualTaskRecord::due_at`] is at or before this.
    pub due_at_or_before: Option<i64>,
}

impl TaskFilter {
    pub fn by_id(id: PerpetualTaskId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            ..Self::default()
        }
    }

    pub fn in_states(mut self, states: impl IntoIterator<Item = TaskState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn matches(&self, record: &PerpetualTaskRecord) -> bool {
        self.id.is_none_or(|id| record.id == id)
            && self
                .account_id
                .as_deref()
                .is_none_or(|a| record.account_id == a)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| record.task_type == t)
            && self
                .client_context
                .as_ref()
                .is_none_or(|c| &record.client_context == c)
            && self
                .delegate_id
                .as_ref()
                .is_none_or(|d| record.delegate_id.as_ref() == Some(d))
            && (self.states.is_empty() || self.states.contains(&record.state))
            && self
                .due_at_or_before
                .is_none_or(|limit| record.due_at().is_some_and(|due| due <= limit))
    }
}

/// Result of [`TaskStore::insert_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Oldest record matching the uniqueness filter; nothing was written.
    Existing(PerpetualTaskRecord),
}

/// Declarative update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub delegate_id: Option<Patch<DelegateId>>,
    pub unassigned_reason: Option<Patch<UnassignedReason>>,
    pub last_heartbeat: Option<Patch<i64>>,
    pub failed_execution_count: Option<u32>,
    pub scheduling: Option<SchedulingVector>,
    pub execution_bundle: Option<Patch<Vec<u8>>>,
    pub interval_seconds: Option<u64>,
    pub client_context_last_updated: Option<i64>,
    /// Stamped on every matched record when set.
    pub last_updated_at: Option<i64>,
}

impl TaskUpdate {
    pub fn apply(&self, record: &mut PerpetualTaskRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(patch) = self.delegate_id.clone() {
            patch.apply(&mut record.delegate_id);
        }
        if let Some(patch) = self.unassigned_reason.clone() {
            patch.apply(&mut record.unassigned_reason);
        }
        if let Some(patch) = self.last_heartbeat.clone() {
            patch.apply(&mut record.last_heartbeat);
        }
        if let Some(count) = self.failed_execution_count {
            record.failed_execution_count = count;
        }
        if let Some(scheduling) = &self.scheduling {
            record.scheduling = scheduling.clone();
        }
        if let Some(patch) = self.execution_bundle.clone() {
            patch.apply(&mut record.execution_bundle);
        }
        if let Some(interval) = self.interval_seconds {
            record.interval_seconds = interval;
        }
        if let Some(ts) = self.client_context_last_updated {
            record.client_context_last_updated = ts;
        }
        if let Some(ts) = self.last_updated_at {
            record.last_updated_at = ts;
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::Duplicate`] on id clash.
    async fn insert(&self, record: PerpetualTaskRecord) -> Result<(), StoreError>;

    /// Insert `record` unless a record matching `unique` exists. The lookup
    /// and the insert are one atomic step.
    async fn insert_if_absent(
        &self,
        unique: &TaskFilter,
        record: PerpetualTaskRecord,
    ) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, id: PerpetualTaskId) -> Result<Option<PerpetualTaskRecord>, StoreError>;

    /// Oldest matching record.
    async fn find_one(&self, filter: &TaskFilter) -> Result<Option<PerpetualTaskRecord>, StoreError>;

    /// All matching records, oldest first.
    async fn find(&self, filter: &TaskFilter) -> Result<Vec<PerpetualTaskRecord>, StoreError>;

    /// Apply `update` to every matching record atomically. Returns the number affected.
    async fn update(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<u64, StoreError>;

    /// Delete every matching record. Returns the number deleted.
    async fn delete(&self, filter: &TaskFilter) -> Result<u64, StoreError>;
}
