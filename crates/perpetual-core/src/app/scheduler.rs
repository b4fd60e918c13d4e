//! AssignmentScheduler - 未割り当てタスクを delegate に割り当てるループ
//!
//! # フロー（1 pass = `run_once`）
//! 1. 期限の来た UNASSIGNED / TO_REBALANCE タスクを due 順に読む
//! 2. タスクごとに [`DelegateSelector`] へ問い合わせる
//! 3. 成功: ASSIGNED に（id だけをキーにした書き込み。後勝ち）
//! 4. 失敗: `UnassignedReason` を記録し、[`IterationStrategy`] に沿って
//!    backoff（既定は Fibonacci 分）
//!
//! 複数プロセスの pass は重なってよい。失敗の書き込みはタスクがまだ
//! 割り当て待ちであることを条件にしている。
//!
//! Stuck-task checks are throttled per scheduler instance, not per process.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::registry::PerpetualTaskRegistry;
use crate::domain::scheduling::duration_ms;
use crate::domain::{IterationStrategy, RegistryError, TaskState};
use crate::ports::DelegateSelector;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Most tasks examined per pass.
    pub batch_size: usize,
    pub strategy: IterationStrategy,
    /// How many upcoming retry timestamps to keep on a failed task.
    pub assigner_iterations: usize,
    pub stuck_check_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            batch_size: 100,
            strategy: IterationStrategy::fibonacci_default(),
            assigner_iterations: 3,
            stuck_check_interval: Duration::from_secs(600),
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub examined: usize,
    pub assigned: usize,
    pub failed: usize,
    /// Tasks whose state changed under us between read and write.
    pub lost_races: usize,
    /// Tasks at the backoff cap, when the stuck check ran this pass.
    pub stuck: Option<usize>,
}

/// AssignmentScheduler は割り当て pass の実行者
///
/// stuck チェックの最終実行時刻はインスタンスごとに保持する（static にしない）。
pub struct AssignmentScheduler {
    registry: Arc<PerpetualTaskRegistry>,
    selector: Arc<dyn DelegateSelector>,
    settings: SchedulerSettings,
    last_stuck_check: AtomicI64,
}

impl AssignmentScheduler {
    pub fn new(
        registry: Arc<PerpetualTaskRegistry>,
        selector: Arc<dyn DelegateSelector>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            selector,
            settings,
            last_stuck_check: AtomicI64::new(i64::MIN),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub async fn run_once(&self) -> Result<PassReport, RegistryError> {
        let now = self.registry.clock().now_millis();
        let due = self
            .registry
            .due_for_assignment(now, self.settings.batch_size)
            .await?;

        let mut report = PassReport {
            examined: due.len(),
            ..PassReport::default()
        };

        for task in due {
            match self.selector.select_delegate(&task).await {
                Ok(delegate_id) => {
                    if self.registry.appoint_delegate(task.id, &delegate_id).await? {
                        info!(
                            task_id = %task.id,
                            delegate_id = %delegate_id,
                            rebalanced = task.state == TaskState::ToRebalance,
                            "perpetual task assigned"
                        );
                        report.assigned += 1;
                    } else {
                        report.lost_races += 1;
                    }
                }
                Err(reason) => {
                    let mut scheduling = task.scheduling.clone();
                    let next_attempt =
                        scheduling.record_failure(now, &self.settings.strategy, self.settings.assigner_iterations);
                    let try_count = scheduling.assign_try_count;
                    if self
                        .registry
                        .record_assignment_failure(task.id, reason, scheduling)
                        .await?
                    {
                        debug!(
                            task_id = %task.id,
                            %reason,
                            try_count,
                            next_attempt,
                            "perpetual task not assigned"
                        );
                        report.failed += 1;
                    } else {
                        report.lost_races += 1;
                    }
                }
            }
        }

        report.stuck = self.check_stuck(now).await?;
        Ok(report)
    }

    /// Log tasks at the backoff cap, at most once per `stuck_check_interval`.
    async fn check_stuck(&self, now: i64) -> Result<Option<usize>, RegistryError> {
        let Some(cap) = self.settings.strategy.cap_index() else {
            return Ok(None);
        };
        let last = self.last_stuck_check.load(Ordering::SeqCst);
        if now.saturating_sub(last) < duration_ms(self.settings.stuck_check_interval) {
            return Ok(None);
        }
        if self
            .last_stuck_check
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }

        let stuck = self.registry.list_stuck_tasks(cap).await?;
        for task in &stuck {
            warn!(
                task_id = %task.id,
                account_id = %task.account_id,
                task_type = %task.task_type,
                reason = ?task.unassigned_reason,
                "perpetual task stuck at maximum assignment backoff"
            );
        }
        Ok(Some(stuck.len()))
    }

    /// Run passes every `tick_interval` until shut down.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.settings.tick_interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.run_once().await {
                    Ok(report) if report.examined > 0 => debug!(?report, "assignment pass"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "assignment pass failed"),
                }
            }
            info!("assignment scheduler stopped");
        });

        SchedulerHandle { cancel, join }
    }
}

/// Handle to a spawned scheduler loop.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the pass in progress, if any.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Returns `false` when the loop did not exit cleanly (it panicked).
    pub async fn shutdown_and_join(self) -> bool {
        self.request_shutdown();
        match self.join.await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "assignment scheduler loop failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::domain::{
        ClientContext, DelegateId, NewPerpetualTask, PerpetualTaskId, PerpetualTaskRecord, UnassignedReason,
    };
    use crate::impls::InMemoryRecordStore;
    use crate::ports::{Clock, ManualClock, UlidGenerator};
    use crate::test_support::EventCapture;
    use tracing::Level;

    const MINUTE_MS: i64 = 60_000;

    /// Answers with whatever delegate is currently configured.
    #[derive(Default)]
    struct SwitchableSelector {
        delegate: Mutex<Option<DelegateId>>,
    }

    impl SwitchableSelector {
        fn offer(&self, delegate: Option<&str>) {
            *self.delegate.lock().unwrap() = delegate.map(DelegateId::new);
        }
    }

    #[async_trait]
    impl DelegateSelector for SwitchableSelector {
        async fn select_delegate(&self, _task: &PerpetualTaskRecord) -> Result<DelegateId, UnassignedReason> {
            self.delegate
                .lock()
                .unwrap()
                .clone()
                .ok_or(UnassignedReason::NoDelegateAvailable)
        }
    }

    struct Fixture {
        registry: Arc<PerpetualTaskRegistry>,
        selector: Arc<SwitchableSelector>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock_arc)));
        let registry = Arc::new(PerpetualTaskRegistry::new(
            Arc::new(InMemoryRecordStore::new()),
            clock_arc,
            ids,
        ));
        Fixture {
            registry,
            selector: Arc::new(SwitchableSelector::default()),
            clock,
        }
    }

    impl Fixture {
        fn scheduler(&self, settings: SchedulerSettings) -> AssignmentScheduler {
            AssignmentScheduler::new(Arc::clone(&self.registry), self.selector.clone(), settings)
        }

        async fn create(&self, client: &str) -> PerpetualTaskId {
            let spec = NewPerpetualTask::new("acc", "ecs_sync", ClientContext::client_id(client))
                .with_interval_seconds(30);
            self.registry.create_task(spec).await.unwrap()
        }
    }

    #[tokio::test]
    async fn no_delegate_backs_off_one_minute() {
        let fx = fixture();
        let scheduler = fx.scheduler(SchedulerSettings::default());
        let id = fx.create("c").await;
        let now = fx.clock.now_millis();

        let report = scheduler.run_once().await.unwrap();

        assert_eq!(report.failed, 1);
        let task = fx.registry.get_task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Unassigned);
        assert_eq!(task.unassigned_reason, Some(UnassignedReason::NoDelegateAvailable));
        assert_eq!(task.scheduling.assign_try_count, 1);
        assert_eq!(task.scheduling.assign_after_ms, now + MINUTE_MS);
        assert!(task.is_consistent());
    }

    #[tokio::test]
    async fn failed_task_waits_for_assign_after() {
        let fx = fixture();
        let scheduler = fx.scheduler(SchedulerSettings::default());
        let id = fx.create("c").await;
        scheduler.run_once().await.unwrap();

        fx.clock.advance(Duration::from_secs(59));
        assert_eq!(scheduler.run_once().await.unwrap().examined, 0);

        fx.clock.advance(Duration::from_secs(1));
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.examined, 1);

        let task = fx.registry.get_task(id).await.unwrap();
        assert_eq!(task.scheduling.assign_try_count, 2);
        assert_eq!(task.scheduling.assign_after_ms, fx.clock.now_millis() + MINUTE_MS);
    }

    #[tokio::test]
    async fn success_assigns_and_clears_backoff() {
        let fx = fixture();
        let scheduler = fx.scheduler(SchedulerSettings::default());
        let id = fx.create("c").await;
        scheduler.run_once().await.unwrap();
        fx.clock.advance(Duration::from_secs(60));
        fx.selector.offer(Some("d-1"));

        let report = scheduler.run_once().await.unwrap();

        assert_eq!(report.assigned, 1);
        let task = fx.registry.get_task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        assert_eq!(task.delegate_id, Some(DelegateId::new("d-1")));
        assert_eq!(task.unassigned_reason, None);
        assert_eq!(task.scheduling.assign_try_count, 0);
        assert_eq!(task.scheduling.assign_after_ms, 0);
        assert!(task.is_consistent());
    }

    #[tokio::test]
    async fn rebalanced_tasks_are_rehomed_on_next_pass() {
        let fx = fixture();
        let scheduler = fx.scheduler(SchedulerSettings::default());
        let id = fx.create("c").await;
        fx.selector.offer(Some("d-1"));
        scheduler.run_once().await.unwrap();

        fx.registry
            .mark_all_tasks_on_delegate_for_reassignment(&DelegateId::new("d-1"))
            .await
            .unwrap();
        fx.selector.offer(Some("d-2"));
        scheduler.run_once().await.unwrap();

        let task = fx.registry.get_task(id).await.unwrap();
        assert_eq!(task.delegate_id, Some(DelegateId::new("d-2")));
        assert!(task.is_consistent());
    }

    #[tokio::test]
    async fn batch_size_limits_a_pass() {
        let fx = fixture();
        let scheduler = fx.scheduler(SchedulerSettings {
            batch_size: 2,
            ..SchedulerSettings::default()
        });
        for client in ["a", "b", "c"] {
            fx.create(client).await;
        }
        fx.selector.offer(Some("d"));

        assert_eq!(scheduler.run_once().await.unwrap().assigned, 2);
        assert_eq!(scheduler.run_once().await.unwrap().assigned, 1);
    }

    #[tokio::test]
    async fn paused_tasks_are_skipped() {
        let fx = fixture();
        let scheduler = fx.scheduler(SchedulerSettings::default());
        let id = fx.create("c").await;
        fx.registry.pause_task("acc", id).await.unwrap();
        fx.selector.offer(Some("d"));

        assert_eq!(scheduler.run_once().await.unwrap().examined, 0);
    }

    #[tokio::test]
    async fn stuck_check_is_throttled_per_instance() {
        let fx = fixture();
        let settings = SchedulerSettings {
            strategy: IterationStrategy::Fibonacci {
                unit: Duration::from_secs(1),
                cap_index: 2,
            },
            stuck_check_interval: Duration::from_secs(60),
            ..SchedulerSettings::default()
        };
        let scheduler = fx.scheduler(settings.clone());
        fx.create("c").await;

        assert_eq!(scheduler.run_once().await.unwrap().stuck, Some(0));
        fx.clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.run_once().await.unwrap().stuck, None);

        // A second instance keeps its own throttle.
        let other = fx.scheduler(settings);
        assert_eq!(other.run_once().await.unwrap().stuck, Some(1));

        fx.clock.advance(Duration::from_secs(60));
        assert_eq!(scheduler.run_once().await.unwrap().stuck, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_assigns_until_shutdown() {
        let fx = fixture();
        let id = fx.create("c").await;
        fx.selector.offer(Some("d-1"));
        let scheduler = Arc::new(fx.scheduler(SchedulerSettings::default()));

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(handle.shutdown_and_join().await);

        assert_eq!(fx.registry.get_task(id).await.unwrap().state, TaskState::Assigned);
    }

    struct PanickingSelector;

    #[async_trait]
    impl DelegateSelector for PanickingSelector {
        async fn select_delegate(&self, _task: &PerpetualTaskRecord) -> Result<DelegateId, UnassignedReason> {
            panic!("selector blew up");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_loop_is_reported_on_join() {
        let (capture, _guard) = EventCapture::install();
        let fx = fixture();
        fx.create("c").await;
        let scheduler = Arc::new(AssignmentScheduler::new(
            Arc::clone(&fx.registry),
            Arc::new(PanickingSelector),
            SchedulerSettings::default(),
        ));

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!handle.shutdown_and_join().await);
        let warnings = capture.at_level(Level::WARN);
        assert!(
            warnings
                .iter()
                .any(|e| e.field("message") == Some("assignment scheduler loop failed"))
        );
    }
}
