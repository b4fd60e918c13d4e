//! Task - perpetual task のレコードと状態
//!
//! # 不変条件（Invariants）
//! - `delegate_id.is_some()` exactly when `state == Assigned`.
//! - `unassigned_reason` is only set while `Unassigned` or `ToRebalance`.
//! - `last_heartbeat` is only meaningful while `Assigned`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{DelegateId, PerpetualTaskId};
use super::scheduling::SchedulingVector;

/// TaskState はタスクの状態を表現
///
/// # 状態遷移
/// - UNASSIGNED -> ASSIGNED: scheduler が delegate を見つけた
/// - ASSIGNED -> TO_REBALANCE: delegate が切断された
/// - TO_REBALANCE -> ASSIGNED / UNASSIGNED: 次の pass で再割り当て
/// - * -> PAUSED: pause_task、PAUSED -> UNASSIGNED: resume_task
/// - * -> INVALID: mark_task_invalid（以後スケジュールされない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting for a delegate.
    Unassigned,
    /// Owned by a delegate.
    Assigned,
    /// Owner went away; the next pass should re-home it immediately.
    ToRebalance,
    /// Stopped by its owner until explicitly resumed.
    Paused,
    /// Failed validation permanently; never scheduled again.
    Invalid,
}

impl TaskState {
    /// Does the assignment scheduler pick tasks in this state?
    pub fn is_schedulable(self) -> bool {
        matches!(self, TaskState::Unassigned | TaskState::ToRebalance)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Unassigned => "UNASSIGNED",
            TaskState::Assigned => "ASSIGNED",
            TaskState::ToRebalance => "TO_REBALANCE",
            TaskState::Paused => "PAUSED",
            TaskState::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// UnassignedReason はオーナー不在の理由
///
/// UNASSIGNED / TO_REBALANCE の間だけ設定される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnassignedReason {
    NoDelegateAvailable,
    NoDelegateInstalled,
    NoEligibleDelegates,
    TaskExpired,
    TaskValidationFailed,
    PtTaskFailed,
    DelegateDisconnected,
}

impl fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnassignedReason::NoDelegateAvailable => "NO_DELEGATE_AVAILABLE",
            UnassignedReason::NoDelegateInstalled => "NO_DELEGATE_INSTALLED",
            UnassignedReason::NoEligibleDelegates => "NO_ELIGIBLE_DELEGATES",
            UnassignedReason::TaskExpired => "TASK_EXPIRED",
            UnassignedReason::TaskValidationFailed => "TASK_VALIDATION_FAILED",
            UnassignedReason::PtTaskFailed => "PT_TASK_FAILED",
            UnassignedReason::DelegateDisconnected => "DELEGATE_DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// Correlation key identifying "the same logical task" across create calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientContext {
    ClientId(String),
    ClientParams(BTreeMap<String, String>),
}

impl ClientContext {
    pub fn client_id(id: impl Into<String>) -> Self {
        Self::ClientId(id.into())
    }

    pub fn params<K, V, I>(params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::ClientParams(
            params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Everything a collaborator supplies to create a perpetual task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPerpetualTask {
    pub account_id: String,
    pub task_type: String,
    pub client_context: ClientContext,
    pub interval_seconds: u64,
    pub timeout_millis: u64,
    #[serde(default)]
    pub execution_bundle: Option<Vec<u8>>,
}

impl NewPerpetualTask {
    pub fn new(
        account_id: impl Into<String>,
        task_type: impl Into<String>,
        client_context: ClientContext,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            task_type: task_type.into(),
            client_context,
            interval_seconds: 60,
            timeout_millis: 30_000,
            execution_bundle: None,
        }
    }

    pub fn with_interval_seconds(mut self, interval_seconds: u64) -> Self {
        self.interval_seconds = interval_seconds;
        self
    }

    pub fn with_timeout_millis(mut self, timeout_millis: u64) -> Self {
        self.timeout_millis = timeout_millis;
        self
    }

    pub fn with_execution_bundle(mut self, bundle: Vec<u8>) -> Self {
        self.execution_bundle = Some(bundle);
        self
    }
}

/// Persisted perpetual task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpetualTaskRecord {
    pub id: PerpetualTaskId,
    pub account_id: String,
    pub task_type: String,
    pub client_context: ClientContext,
    pub client_context_last_updated: i64,
    pub interval_seconds: u64,
    pub timeout_millis: u64,

    pub delegate_id: Option<DelegateId>,
    pub state: TaskState,
    pub unassigned_reason: Option<UnassignedReason>,

    pub last_heartbeat: Option<i64>,
    pub failed_execution_count: u32,

    pub scheduling: SchedulingVector,

    /// Opaque execution parameters handed to the delegate.
    pub execution_bundle: Option<Vec<u8>>,

    pub created_at: i64,
    pub last_updated_at: i64,
}

impl PerpetualTaskRecord {
    pub fn new(id: PerpetualTaskId, spec: NewPerpetualTask, now_ms: i64) -> Self {
        Self {
            id,
            account_id: spec.account_id,
            task_type: spec.task_type,
            client_context: spec.client_context,
            client_context_last_updated: now_ms,
            interval_seconds: spec.interval_seconds,
            timeout_millis: spec.timeout_millis,
            delegate_id: None,
            state: TaskState::Unassigned,
            unassigned_reason: None,
            last_heartbeat: None,
            failed_execution_count: 0,
            scheduling: SchedulingVector::default(),
            execution_bundle: spec.execution_bundle,
            created_at: now_ms,
            last_updated_at: now_ms,
        }
    }

    /// When the scheduler should next look at this task, if ever.
    pub fn due_at(&self) -> Option<i64> {
        match self.state {
            TaskState::Unassigned => Some(self.scheduling.assign_after_ms),
            TaskState::ToRebalance => Some(self.scheduling.rebalance_iteration),
            TaskState::Assigned | TaskState::Paused | TaskState::Invalid => None,
        }
    }

    /// Check the ownership invariants. Used by tests after every transition.
    pub fn is_consistent(&self) -> bool {
        let owner_matches_state = self.delegate_id.is_some() == (self.state == TaskState::Assigned);
        let reason_allowed = self.unassigned_reason.is_none() || self.state.is_schedulable();
        owner_matches_state && reason_allowed
    }
}
