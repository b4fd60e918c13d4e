//! HeartbeatMonitor - delegate からの生存報告
//!
//! Writes are guarded on the task still being ASSIGNED. When the report names
//! its sender, the write is also guarded on that delegate being the current
//! owner, so the loser of a double assignment stops getting acks. A report
//! that matches nothing is dropped; the delegate learns about it from the
//! `false` return.
//!
//! # 設計メモ
//! - `last_heartbeat` の経過時間による掃除はしない
//! - 所有権の剥奪は delegate-health 側が
//!   [`HeartbeatMonitor::delegate_disconnected`] を呼んだ時だけ
//! - sender を省略した報告は ASSIGNED であれば受け付ける

use std::sync::Arc;

use tracing::{debug, info};

use crate::app::registry::PerpetualTaskRegistry;
use crate::domain::{DelegateId, PerpetualTaskId, RegistryError, TaskState};
use crate::ports::{Patch, TaskFilter, TaskUpdate};

/// HeartbeatMonitor は delegate からの報告を受ける窓口
pub struct HeartbeatMonitor {
    registry: Arc<PerpetualTaskRegistry>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<PerpetualTaskRegistry>) -> Self {
        Self { registry }
    }

    /// Returns `false` when the task is not (or no longer) assigned, or is
    /// assigned to a delegate other than `sender`.
    pub async fn save_heartbeat(
        &self,
        id: PerpetualTaskId,
        sender: Option<&DelegateId>,
        heartbeat_ms: i64,
        failed_execution_count: u32,
    ) -> Result<bool, RegistryError> {
        let update = TaskUpdate {
            last_heartbeat: Some(Patch::Set(heartbeat_ms)),
            failed_execution_count: Some(failed_execution_count),
            ..TaskUpdate::default()
        };
        let accepted = self.update_assigned(id, sender, &update).await?;
        if !accepted {
            debug!(task_id = %id, sender = ?sender, "heartbeat dropped; task not owned by sender");
        }
        Ok(accepted)
    }

    /// Store the delegate's consecutive execution failure count.
    pub async fn report_failure(
        &self,
        id: PerpetualTaskId,
        sender: Option<&DelegateId>,
        failed_execution_count: u32,
    ) -> Result<bool, RegistryError> {
        let update = TaskUpdate {
            failed_execution_count: Some(failed_execution_count),
            last_updated_at: Some(self.registry.clock().now_millis()),
            ..TaskUpdate::default()
        };
        self.update_assigned(id, sender, &update).await
    }

    /// The delegate is gone: queue its tasks for rebalance.
    pub async fn delegate_disconnected(&self, delegate_id: &DelegateId) -> Result<u64, RegistryError> {
        let moved = self
            .registry
            .mark_all_tasks_on_delegate_for_reassignment(delegate_id)
            .await?;
        info!(delegate_id = %delegate_id, moved, "delegate disconnected");
        Ok(moved)
    }

    async fn update_assigned(
        &self,
        id: PerpetualTaskId,
        sender: Option<&DelegateId>,
        update: &TaskUpdate,
    ) -> Result<bool, RegistryError> {
        let filter = TaskFilter {
            delegate_id: sender.cloned(),
            ..TaskFilter::by_id(id).in_states([TaskState::Assigned])
        };
        Ok(self.registry.store().update(&filter, update).await? > 0)
    }
}
