//! PerpetualTaskRegistry - perpetual task の台帳
//!
//! Intake and delegate-facing operations over task records.
//!
//! # 設計
//! - Every state transition is a single conditional [`TaskStore::update`].
//!   Methods report whether a record matched (`bool`) or how many did (`u64`)
//!   instead of erroring on a lost race.
//! - Assignment is keyed by id only. Two schedulers racing on the same task
//!   both succeed and the later write wins.

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{
    ClientContext, DelegateId, NewPerpetualTask, PerpetualTaskId, PerpetualTaskRecord, RegistryError,
    SchedulingVector, TaskState, UnassignedReason,
};
use crate::observability::TaskCounts;
use crate::ports::{Clock, IdGenerator, InsertOutcome, Patch, TaskFilter, TaskStore, TaskUpdate};

/// PerpetualTaskRegistry はタスクレコードへの全操作の入口
///
/// - intake API（create / pause / resume / remove ...）
/// - delegate 向け API（割り当て一覧、再割り当て）
/// - scheduler 向け API（due タスクの取得、割り当て結果の書き込み）
pub struct PerpetualTaskRegistry {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl PerpetualTaskRegistry {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    pub(crate) fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ---- intake API ----

    /// Create a task, or return the id of the existing task with the same
    /// account, task type and client context.
    ///
    /// The lookup and the insert are one store operation, so concurrent
    /// creates for the same client context agree on a single id.
    pub async fn create_task(&self, spec: NewPerpetualTask) -> Result<PerpetualTaskId, RegistryError> {
        let unique = Self::client_context_filter(&spec.account_id, &spec.task_type, &spec.client_context);
        let id = self.ids.generate_task_id();
        let record = PerpetualTaskRecord::new(id, spec, self.clock.now_millis());
        let account_id = record.account_id.clone();
        let task_type = record.task_type.clone();

        match self.store.insert_if_absent(&unique, record).await? {
            InsertOutcome::Existing(existing) => {
                debug!(task_id = %existing.id, "perpetual task already exists for client context");
                Ok(existing.id)
            }
            InsertOutcome::Inserted => {
                info!(task_id = %id, %account_id, %task_type, "perpetual task created");
                Ok(id)
            }
        }
    }

    pub async fn get_task(&self, id: PerpetualTaskId) -> Result<PerpetualTaskRecord, RegistryError> {
        self.store.get(id).await?.ok_or(RegistryError::NotFound(id))
    }

    pub async fn find_by_client_context(
        &self,
        account_id: &str,
        task_type: &str,
        client_context: &ClientContext,
    ) -> Result<Option<PerpetualTaskRecord>, RegistryError> {
        let filter = Self::client_context_filter(account_id, task_type, client_context);
        Ok(self.store.find_one(&filter).await?)
    }

    pub async fn list_all_tasks_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<PerpetualTaskRecord>, RegistryError> {
        Ok(self.store.find(&TaskFilter::by_account(account_id)).await?)
    }

    pub async fn counts_for_account(&self, account_id: &str) -> Result<TaskCounts, RegistryError> {
        let tasks = self.list_all_tasks_for_account(account_id).await?;
        Ok(tasks.iter().collect())
    }

    /// Stop a task: clear its owner and execution parameters.
    pub async fn pause_task(&self, account_id: &str, id: PerpetualTaskId) -> Result<bool, RegistryError> {
        let filter = Self::owned(account_id, id);
        let update = TaskUpdate {
            state: Some(TaskState::Paused),
            delegate_id: Some(Patch::Unset),
            unassigned_reason: Some(Patch::Unset),
            last_heartbeat: Some(Patch::Unset),
            execution_bundle: Some(Patch::Unset),
            ..self.stamped()
        };
        let paused = self.store.update(&filter, &update).await? > 0;
        if paused {
            info!(task_id = %id, "perpetual task paused");
        }
        Ok(paused)
    }

    /// Put a paused task back in line for assignment.
    pub async fn resume_task(&self, account_id: &str, id: PerpetualTaskId) -> Result<bool, RegistryError> {
        let filter = Self::owned(account_id, id).in_states([TaskState::Paused]);
        let update = TaskUpdate {
            state: Some(TaskState::Unassigned),
            scheduling: Some(SchedulingVector::default()),
            ..self.stamped()
        };
        let resumed = self.store.update(&filter, &update).await? > 0;
        if resumed {
            info!(task_id = %id, "perpetual task resumed");
        }
        Ok(resumed)
    }

    pub async fn remove_task(&self, account_id: &str, id: PerpetualTaskId) -> Result<bool, RegistryError> {
        let removed = self.store.delete(&Self::owned(account_id, id)).await? > 0;
        if removed {
            info!(task_id = %id, "perpetual task removed");
        }
        Ok(removed)
    }

    pub async fn remove_all_tasks_for_account(&self, account_id: &str) -> Result<u64, RegistryError> {
        let removed = self.store.delete(&TaskFilter::by_account(account_id)).await?;
        info!(account_id, removed, "perpetual tasks removed for account");
        Ok(removed)
    }

    /// The client context was torn down: drop every task it created.
    pub async fn remove_tasks_for_client(
        &self,
        account_id: &str,
        client_context: &ClientContext,
    ) -> Result<u64, RegistryError> {
        let filter = TaskFilter {
            client_context: Some(client_context.clone()),
            ..TaskFilter::by_account(account_id)
        };
        Ok(self.store.delete(&filter).await?)
    }

    pub async fn update_interval_for_task_type(
        &self,
        account_id: &str,
        task_type: &str,
        interval_seconds: u64,
    ) -> Result<u64, RegistryError> {
        let filter = TaskFilter {
            task_type: Some(task_type.to_string()),
            ..TaskFilter::by_account(account_id)
        };
        let update = TaskUpdate {
            interval_seconds: Some(interval_seconds),
            ..self.stamped()
        };
        let updated = self.store.update(&filter, &update).await?;
        info!(account_id, task_type, interval_seconds, updated, "perpetual task interval changed");
        Ok(updated)
    }

    /// Drop the current owner and make the task assignable right away.
    ///
    /// `Some(bundle)` stores new execution parameters; `None` removes them.
    pub async fn reset_delegate_id_for_task(
        &self,
        account_id: &str,
        id: PerpetualTaskId,
        execution_bundle: Option<Vec<u8>>,
    ) -> Result<bool, RegistryError> {
        let update = TaskUpdate {
            state: Some(TaskState::Unassigned),
            delegate_id: Some(Patch::Unset),
            unassigned_reason: Some(Patch::Unset),
            last_heartbeat: Some(Patch::Unset),
            scheduling: Some(SchedulingVector::default()),
            execution_bundle: Some(Patch::from(execution_bundle)),
            ..self.stamped()
        };
        Ok(self.store.update(&Self::owned(account_id, id), &update).await? > 0)
    }

    /// Retire a task that can never run. The scheduler will not pick it again.
    pub async fn mark_task_invalid(&self, account_id: &str, id: PerpetualTaskId) -> Result<bool, RegistryError> {
        let update = TaskUpdate {
            state: Some(TaskState::Invalid),
            delegate_id: Some(Patch::Unset),
            unassigned_reason: Some(Patch::Unset),
            last_heartbeat: Some(Patch::Unset),
            ..self.stamped()
        };
        let marked = self.store.update(&Self::owned(account_id, id), &update).await? > 0;
        if marked {
            info!(task_id = %id, "perpetual task marked invalid");
        }
        Ok(marked)
    }

    // ---- delegate-facing API ----

    pub async fn list_assigned_tasks(
        &self,
        delegate_id: &DelegateId,
    ) -> Result<Vec<PerpetualTaskRecord>, RegistryError> {
        let filter = TaskFilter {
            delegate_id: Some(delegate_id.clone()),
            ..TaskFilter::default()
        }
        .in_states([TaskState::Assigned]);
        Ok(self.store.find(&filter).await?)
    }

    /// Move every task owned by `delegate_id` to TO_REBALANCE, due now.
    pub async fn mark_all_tasks_on_delegate_for_reassignment(
        &self,
        delegate_id: &DelegateId,
    ) -> Result<u64, RegistryError> {
        let now = self.clock.now_millis();
        let filter = TaskFilter {
            delegate_id: Some(delegate_id.clone()),
            ..TaskFilter::default()
        };
        // Assigned tasks carry a cleared vector, so only the rebalance slot changes.
        let mut scheduling = SchedulingVector::default();
        scheduling.schedule_rebalance(now);
        let update = TaskUpdate {
            state: Some(TaskState::ToRebalance),
            delegate_id: Some(Patch::Unset),
            unassigned_reason: Some(Patch::Set(UnassignedReason::DelegateDisconnected)),
            last_heartbeat: Some(Patch::Unset),
            scheduling: Some(scheduling),
            last_updated_at: Some(now),
            ..TaskUpdate::default()
        };
        let moved = self.store.update(&filter, &update).await?;
        info!(delegate_id = %delegate_id, moved, "tasks marked for reassignment");
        Ok(moved)
    }

    // ---- scheduler API ----

    /// Unassigned and to-rebalance tasks due at `now_ms`, most overdue first.
    pub async fn due_for_assignment(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<PerpetualTaskRecord>, RegistryError> {
        let filter = TaskFilter {
            due_at_or_before: Some(now_ms),
            ..TaskFilter::default()
        }
        .in_states([TaskState::Unassigned, TaskState::ToRebalance]);
        let mut due = self.store.find(&filter).await?;
        due.sort_by_key(|r| (r.due_at(), r.created_at));
        due.truncate(limit);
        Ok(due)
    }

    /// Unassigned tasks whose failure count has reached `cap`.
    pub async fn list_stuck_tasks(&self, cap: u32) -> Result<Vec<PerpetualTaskRecord>, RegistryError> {
        let filter = TaskFilter::default().in_states([TaskState::Unassigned]);
        let mut tasks = self.store.find(&filter).await?;
        tasks.retain(|r| r.scheduling.assign_try_count >= cap);
        Ok(tasks)
    }

    /// Hand a task to `delegate_id`.
    pub async fn appoint_delegate(
        &self,
        id: PerpetualTaskId,
        delegate_id: &DelegateId,
    ) -> Result<bool, RegistryError> {
        let now = self.clock.now_millis();
        let update = TaskUpdate {
            state: Some(TaskState::Assigned),
            delegate_id: Some(Patch::Set(delegate_id.clone())),
            unassigned_reason: Some(Patch::Unset),
            last_heartbeat: Some(Patch::Unset),
            scheduling: Some(SchedulingVector::default()),
            client_context_last_updated: Some(now),
            last_updated_at: Some(now),
            ..TaskUpdate::default()
        };
        Ok(self.store.update(&TaskFilter::by_id(id), &update).await? > 0)
    }

    /// Store a failed attempt. Only applies while the task is still waiting
    /// for an owner.
    pub async fn record_assignment_failure(
        &self,
        id: PerpetualTaskId,
        reason: UnassignedReason,
        scheduling: SchedulingVector,
    ) -> Result<bool, RegistryError> {
        let filter = TaskFilter::by_id(id).in_states([TaskState::Unassigned, TaskState::ToRebalance]);
        let update = TaskUpdate {
            state: Some(TaskState::Unassigned),
            delegate_id: Some(Patch::Unset),
            unassigned_reason: Some(Patch::Set(reason)),
            scheduling: Some(scheduling),
            ..self.stamped()
        };
        Ok(self.store.update(&filter, &update).await? > 0)
    }

    fn client_context_filter(account_id: &str, task_type: &str, client_context: &ClientContext) -> TaskFilter {
        TaskFilter {
            task_type: Some(task_type.to_string()),
            client_context: Some(client_context.clone()),
            ..TaskFilter::by_account(account_id)
        }
    }

    fn owned(account_id: &str, id: PerpetualTaskId) -> TaskFilter {
        TaskFilter {
            id: Some(id),
            ..TaskFilter::by_account(account_id)
        }
    }

    fn stamped(&self) -> TaskUpdate {
        TaskUpdate {
            last_updated_at: Some(self.clock.now_millis()),
            ..TaskUpdate::default()
        }
    }
}
