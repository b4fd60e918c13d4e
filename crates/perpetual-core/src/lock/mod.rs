//! Lock - [`LockStore`] 上の分散ロック
//!
//! # 設計
//! - One non-blocking attempt per `acquire_*` call. Waiting is opt-in through
//!   `wait_to_acquire_*`, which polls at a fixed interval.
//! - Lease age is measured on [`Clock::monotonic`].
//! - There is no fencing token. A holder that overruns its timeout can lose
//!   the lock to someone else and will still unlock it by name on release.
//!   The overrun is reported at `close` time as a critical event.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::{LockError, LockOwnerId};
use crate::ports::{Clock, IdGenerator, LockRequest, LockStore, TryLockOutcome};

pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock name for an entity instance: `"<entity>-<id>"`.
pub fn entity_lock_name(entity: &str, id: &str) -> String {
    format!("{entity}-{id}")
}

/// PersistentLocker はロックの取得口
///
/// 取得した [`AcquiredLock`] は `close` で返すこと。
pub struct PersistentLocker {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    wait_poll_interval: Duration,
}

impl PersistentLocker {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            store,
            clock,
            ids,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        }
    }

    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    /// Take `name` now or fail with [`LockError::CouldNotAcquire`].
    pub async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<AcquiredLock, LockError> {
        self.attempt(name, timeout, false)
            .await?
            .ok_or_else(|| LockError::CouldNotAcquire { name: name.to_string() })
    }

    pub async fn acquire_lock_for_entity(
        &self,
        entity: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<AcquiredLock, LockError> {
        self.acquire_lock(&entity_lock_name(entity, id), timeout).await
    }

    /// Like [`Self::acquire_lock`], but the record is deleted on release.
    pub async fn acquire_ephemeral_lock(&self, name: &str, timeout: Duration) -> Result<AcquiredLock, LockError> {
        self.attempt(name, timeout, true)
            .await?
            .ok_or_else(|| LockError::CouldNotAcquire { name: name.to_string() })
    }

    /// Single attempt that reports "busy" as `None` instead of an error.
    pub async fn try_to_acquire_lock(&self, name: &str, timeout: Duration) -> Result<Option<AcquiredLock>, LockError> {
        self.attempt(name, timeout, false).await
    }

    pub async fn try_to_acquire_lock_for_entity(
        &self,
        entity: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<Option<AcquiredLock>, LockError> {
        self.try_to_acquire_lock(&entity_lock_name(entity, id), timeout).await
    }

    /// Retry every poll interval until acquired or `wait_timeout` runs out.
    pub async fn wait_to_acquire_lock(
        &self,
        name: &str,
        lock_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<AcquiredLock, LockError> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            if let Some(lock) = self.attempt(name, lock_timeout, false).await? {
                return Ok(lock);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::WaitTimeout {
                    name: name.to_string(),
                    waited: wait_timeout,
                });
            }
            tokio::time::sleep(self.wait_poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn wait_to_acquire_lock_for_entity(
        &self,
        entity: &str,
        id: &str,
        lock_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<AcquiredLock, LockError> {
        self.wait_to_acquire_lock(&entity_lock_name(entity, id), lock_timeout, wait_timeout)
            .await
    }

    /// Delete the lock record outright.
    ///
    /// Always ends in an error: whoever destroys a lock has declared the
    /// section it guarded no longer exclusive, and the caller must deal
    /// with that.
    pub async fn destroy(&self, mut lock: AcquiredLock) -> Result<(), LockError> {
        lock.released = true;
        let existed = self.store.delete(&lock.name).await?;
        warn!(lock = %lock.name, owner = %lock.owner, existed, "lock destroyed");
        Err(LockError::Destroyed { name: lock.name.clone() })
    }

    async fn attempt(
        &self,
        name: &str,
        timeout: Duration,
        ephemeral: bool,
    ) -> Result<Option<AcquiredLock>, LockError> {
        let owner = self.ids.generate_lock_owner();
        let now = self.clock.monotonic();
        let outcome = self
            .store
            .try_lock(LockRequest {
                name: name.to_string(),
                owner,
                now_monotonic: now,
                inactive_timeout: timeout,
                ephemeral,
            })
            .await?;

        match outcome {
            TryLockOutcome::Busy => {
                debug!(lock = %name, "lock busy");
                return Ok(None);
            }
            TryLockOutcome::AcquiredAbandoned { previous_owner } => {
                warn!(lock = %name, %previous_owner, "took over abandoned lock");
            }
            TryLockOutcome::Acquired => {
                debug!(lock = %name, %owner, "lock acquired");
            }
        }

        Ok(Some(AcquiredLock {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            name: name.to_string(),
            owner,
            acquired_at: now,
            timeout,
            ephemeral,
            released: false,
        }))
    }
}

/// Handle to a held lock.
///
/// Dropping an unreleased handle schedules a release on the current tokio
/// runtime. Prefer [`AcquiredLock::close`], which also reports overruns.
pub struct AcquiredLock {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    name: String,
    owner: LockOwnerId,
    acquired_at: Duration,
    timeout: Duration,
    ephemeral: bool,
    released: bool,
}

impl fmt::Debug for AcquiredLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredLock")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("timeout", &self.timeout)
            .field("ephemeral", &self.ephemeral)
            .field("released", &self.released)
            .finish()
    }
}

impl AcquiredLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> LockOwnerId {
        self.owner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Monotonic time held so far.
    pub fn elapsed(&self) -> Duration {
        self.clock.monotonic().saturating_sub(self.acquired_at)
    }

    /// Unlock. A second call is a no-op.
    pub async fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        release_record(self.store.as_ref(), &self.name, self.owner, self.ephemeral).await?;
        self.released = true;
        Ok(())
    }

    /// Scoped release: report an overrun, then release anyway.
    ///
    /// The overrun boundary matches [`LockRecord::is_expired`]: once
    /// `elapsed >= timeout` another caller may already hold the lock.
    ///
    /// [`LockRecord::is_expired`]: crate::domain::LockRecord::is_expired
    pub async fn close(mut self) -> Result<(), LockError> {
        let elapsed = self.elapsed();
        if elapsed >= self.timeout {
            error!(
                severity = "critical",
                lock = %self.name,
                owner = %self.owner,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = self.timeout.as_millis() as u64,
                "lock held past its timeout; another owner may have entered the critical section"
            );
        }
        self.release().await
    }
}

async fn release_record(
    store: &dyn LockStore,
    name: &str,
    owner: LockOwnerId,
    ephemeral: bool,
) -> Result<(), LockError> {
    if ephemeral {
        store.delete(name).await?;
        debug!(lock = %name, %owner, "ephemeral lock deleted");
        return Ok(());
    }
    match store.unlock(name).await? {
        None => info!(lock = %name, %owner, "lock was not locked at release"),
        Some(previous) if previous.owner != Some(owner) => warn!(
            lock = %name,
            %owner,
            holder = ?previous.owner,
            "released a lock held by another owner"
        ),
        Some(_) => debug!(lock = %name, %owner, "lock released"),
    }
    Ok(())
}

impl Drop for AcquiredLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.name, "lock dropped outside a runtime; left to expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let name = std::mem::take(&mut self.name);
        let owner = self.owner;
        let ephemeral = self.ephemeral;
        handle.spawn(async move {
            if let Err(err) = release_record(store.as_ref(), &name, owner, ephemeral).await {
                warn!(lock = %name, error = %err, "release on drop failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryRecordStore;
    use crate::ports::{ManualClock, UlidGenerator};
    use crate::test_support::EventCapture;
    use tracing::Level;

    fn locker() -> (PersistentLocker, Arc<InMemoryRecordStore>, ManualClock) {
        let store = Arc::new(InMemoryRecordStore::new());
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock_arc)));
        let locker = PersistentLocker::new(store.clone(), clock_arc, ids);
        (locker, store, clock)
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let (locker, _, _) = locker();
        let _held = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();

        let err = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(err, LockError::CouldNotAcquire { ref name } if name == "foo"));
    }

    #[tokio::test]
    async fn late_close_still_releases() {
        let (locker, store, clock) = locker();
        let lock = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_secs(6));

        lock.close().await.unwrap();

        let record = LockStore::get(&*store, "foo").await.unwrap().unwrap();
        assert!(!record.is_locked());
    }

    #[tokio::test]
    async fn late_close_reports_one_critical_event() {
        let (capture, _guard) = EventCapture::install();
        let (locker, _, clock) = locker();
        let lock = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_secs(6));

        lock.close().await.unwrap();

        let errors = capture.at_level(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field("severity"), Some("critical"));
        assert_eq!(errors[0].field("lock"), Some("foo"));
    }

    #[tokio::test]
    async fn on_time_close_reports_nothing() {
        let (capture, _guard) = EventCapture::install();
        let (locker, _, clock) = locker();
        let lock = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_millis(4_999));

        lock.close().await.unwrap();

        assert!(capture.at_level(Level::ERROR).is_empty());
    }

    #[tokio::test]
    async fn abandoned_lock_is_taken_and_stale_close_evicts_new_holder() {
        let (capture, _guard) = EventCapture::install();
        let (locker, store, clock) = locker();
        let stale = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();
        // Exactly at the timeout the record counts as abandoned.
        clock.advance(Duration::from_secs(5));

        let fresh = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();
        stale.close().await.unwrap();

        // No fencing: the stale holder unlocked the fresh holder's lock, and said so.
        let record = LockStore::get(&*store, "foo").await.unwrap().unwrap();
        assert!(!record.is_locked());
        let errors = capture.at_level(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field("severity"), Some("critical"));
        drop(fresh);
    }

    #[tokio::test]
    async fn debug_output_names_the_lock() {
        let (locker, _, _) = locker();
        let mut lock = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();
        lock.release().await.unwrap();

        let debug = format!("{lock:?}");
        assert!(debug.contains("\"foo\""));
        assert!(debug.contains("released: true"));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (locker, _, _) = locker();
        let mut lock = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();

        lock.release().await.unwrap();
        lock.release().await.unwrap();

        assert!(lock.is_released());
        assert!(locker.acquire_lock("foo", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn entity_lock_names_combine_entity_and_id() {
        let (locker, _, _) = locker();
        let held = locker
            .try_to_acquire_lock_for_entity("Pipeline", "p-1", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.name(), "Pipeline-p-1");

        let again = locker
            .try_to_acquire_lock("Pipeline-p-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn try_by_name_reports_busy_as_none() {
        let (locker, _, _) = locker();
        let mut held = locker
            .try_to_acquire_lock("foo", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(locker.try_to_acquire_lock("foo", Duration::from_secs(5)).await.unwrap().is_none());

        held.release().await.unwrap();
        assert!(locker.try_to_acquire_lock("foo", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ephemeral_release_deletes_record() {
        let (locker, store, _) = locker();
        let lock = locker.acquire_ephemeral_lock("tmp", Duration::from_secs(5)).await.unwrap();

        lock.close().await.unwrap();

        assert!(LockStore::get(&*store, "tmp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn destroy_always_errors_and_removes_record() {
        let (locker, store, _) = locker();
        let lock = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();

        let err = locker.destroy(lock).await.unwrap_err();

        assert!(matches!(err, LockError::Destroyed { .. }));
        assert!(LockStore::get(&*store, "foo").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_while_held() {
        let (locker, _, _) = locker();
        let _held = locker.acquire_lock("foo", Duration::from_secs(60)).await.unwrap();

        let err = locker
            .wait_to_acquire_lock("foo", Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::WaitTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_succeeds_once_holder_releases() {
        let (locker, _, _) = locker();
        let mut held = locker.acquire_lock("foo", Duration::from_secs(60)).await.unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            held.release().await.unwrap();
        });

        let lock = locker
            .wait_to_acquire_lock("foo", Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(lock.name(), "foo");
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn drop_releases_in_background() {
        let (locker, store, _) = locker();
        let lock = locker.acquire_lock("foo", Duration::from_secs(5)).await.unwrap();

        drop(lock);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let record = LockStore::get(&*store, "foo").await.unwrap().unwrap();
        assert!(!record.is_locked());
    }
}
