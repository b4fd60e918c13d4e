//! LockStore port: named lock records.
//!
//! `try_lock` is the only primitive that needs to be atomic. An abandoned
//! lock (see [`LockRecord::is_expired`]) is handed to the next caller without
//! consulting its previous owner.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{LockOwnerId, LockRecord, StoreError};

/// Request to take a lock.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub name: String,
    pub owner: LockOwnerId,
    pub now_monotonic: Duration,
    pub inactive_timeout: Duration,
    pub ephemeral: bool,
}

/// Result of a single non-blocking attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryLockOutcome {
    Acquired,
    /// Taken over from a holder whose lease had run out.
    AcquiredAbandoned { previous_owner: LockOwnerId },
    Busy,
}

impl TryLockOutcome {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, TryLockOutcome::Busy)
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create the record if missing, then take it if free or abandoned.
    async fn try_lock(&self, request: LockRequest) -> Result<TryLockOutcome, StoreError>;

    /// Clear the owner. Returns the record as it was before the unlock, or
    /// `None` if it was missing or not locked.
    async fn unlock(&self, name: &str) -> Result<Option<LockRecord>, StoreError>;

    async fn get(&self, name: &str) -> Result<Option<LockRecord>, StoreError>;

    /// Remove the record outright. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;
}
