//! Observability - ダッシュボードと CLI 向けの集計ビュー

use serde::{Deserialize, Serialize};

use crate::domain::{PerpetualTaskRecord, TaskState};

/// Perpetual tasks of one account, by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub unassigned: u64,
    pub assigned: u64,
    pub to_rebalance: u64,
    pub paused: u64,
    pub invalid: u64,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState) {
        let slot = match state {
            TaskState::Unassigned => &mut self.unassigned,
            TaskState::Assigned => &mut self.assigned,
            TaskState::ToRebalance => &mut self.to_rebalance,
            TaskState::Paused => &mut self.paused,
            TaskState::Invalid => &mut self.invalid,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u64 {
        self.unassigned + self.assigned + self.to_rebalance + self.paused + self.invalid
    }
}

impl<'a> FromIterator<&'a PerpetualTaskRecord> for TaskCounts {
    fn from_iter<I: IntoIterator<Item = &'a PerpetualTaskRecord>>(iter: I) -> Self {
        let mut counts = Self::default();
        for record in iter {
            counts.add(record.state);
        }
        counts
    }
}

/// Messages on a consumer's topics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Visible and waiting.
    pub queued: u64,
    /// Leased or delayed.
    pub running: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.running
    }
}
