//! DelegateSelector port.
//!
//! Picking a delegate (capability matching, scoping, load) belongs to the
//! delegate service. The scheduler only needs a yes with an id, or a no with a
//! reason it can record on the task.

use async_trait::async_trait;

use crate::domain::{DelegateId, PerpetualTaskRecord, UnassignedReason};

#[async_trait]
pub trait DelegateSelector: Send + Sync {
    async fn select_delegate(&self, task: &PerpetualTaskRecord) -> Result<DelegateId, UnassignedReason>;
}
