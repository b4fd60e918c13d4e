//! Clock port - 時刻の抽象化
//!
//! 2 種類の時刻を提供します：
//! - `now`: 壁時計（epoch ms）。heartbeat, `assign_after_ms`, メッセージの
//!   可視時刻など永続化される値はすべてこちら
//! - `monotonic`: 任意の原点からの経過時間。ロックの lease 判定に使い、
//!   壁時計のジャンプでロックが新しく／古く見えることはない
//!
//! # テスト容易性
//! - `ManualClock` は clone 間で状態を共有し、テストから `advance` で進める

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn monotonic(&self) -> Duration;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

fn process_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        process_origin().elapsed()
    }
}

/// Test clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give
/// another to the code under test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    wall_ms: Arc<AtomicI64>,
    monotonic_ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            wall_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
            monotonic_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn at_millis(start_ms: i64) -> Self {
        Self {
            wall_ms: Arc::new(AtomicI64::new(start_ms)),
            monotonic_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move both readings forward.
    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        let ns = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.wall_ms.fetch_add(ms, Ordering::SeqCst);
        self.monotonic_ns.fetch_add(ns, Ordering::SeqCst);
    }

    /// Jump the wall clock only. Monotonic time is unaffected.
    pub fn set_wall(&self, to: DateTime<Utc>) {
        self.wall_ms.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.wall_ms.load(Ordering::SeqCst))
            .single()
            .unwrap_or_default()
    }

    fn monotonic(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::SeqCst))
    }

    fn now_millis(&self) -> i64 {
        self.wall_ms.load(Ordering::SeqCst)
    }
}
