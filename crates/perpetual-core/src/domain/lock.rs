//! Distributed lock record.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::LockOwnerId;

/// A named lock as persisted in the lock store.
///
/// `acquired_at_monotonic` is read from [`crate::ports::Clock::monotonic`].
/// A held lock whose `acquired_at_monotonic + inactive_timeout` has passed is
/// abandoned and can be taken by anyone. Nothing fences the previous owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    /// `None` while the lock is released.
    pub owner: Option<LockOwnerId>,
    pub acquired_at_monotonic: Duration,
    pub inactive_timeout: Duration,
    /// Ephemeral locks delete their record on release.
    pub ephemeral: bool,
}

impl LockRecord {
    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_expired(&self, now_monotonic: Duration) -> bool {
        now_monotonic.saturating_sub(self.acquired_at_monotonic) >= self.inactive_timeout
    }

    /// Locked by someone and not yet abandoned.
    pub fn is_held(&self, now_monotonic: Duration) -> bool {
        self.is_locked() && !self.is_expired(now_monotonic)
    }
}
