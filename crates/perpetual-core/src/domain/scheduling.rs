//! Scheduling vectors: when a perpetual task should next be looked at.
//!
//! A task carries two independent schedules:
//! - the assigner schedule, spaced along the Fibonacci sequence and driven by
//!   consecutive assignment failures;
//! - the rebalance schedule, a single timestamp that is pulled to "now" when
//!   the owning delegate goes away.
//!
//! Both live in one [`SchedulingVector`] value and each is advanced through a
//! named [`IterationStrategy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Highest Fibonacci index used for assignment backoff.
pub const DEFAULT_BACKOFF_CAP_INDEX: u32 = 8;

/// One backoff step is `fibonacci(index)` of this unit.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(60);

/// `fibonacci(0) = 0`, `fibonacci(1) = fibonacci(2) = 1`, ...
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Delay before the next assignment attempt after `try_count` failures.
///
/// The index is clamped to `cap_index`, so the delay stops growing once the
/// cap is reached.
pub fn fibonacci_backoff(try_count: u32, cap_index: u32, unit: Duration) -> Duration {
    let index = try_count.min(cap_index);
    let steps = u32::try_from(fibonacci(index)).unwrap_or(u32::MAX);
    unit.saturating_mul(steps)
}

/// How successive iterations of a schedule are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IterationStrategy {
    /// Fixed spacing.
    Regular { interval: Duration },
    /// Fibonacci spacing, clamped at `cap_index`.
    Fibonacci { unit: Duration, cap_index: u32 },
}

impl IterationStrategy {
    pub fn fibonacci_default() -> Self {
        Self::Fibonacci {
            unit: DEFAULT_BACKOFF_UNIT,
            cap_index: DEFAULT_BACKOFF_CAP_INDEX,
        }
    }

    /// Offset from "now" of iteration number `step` (1-based).
    pub fn offset(&self, step: u32) -> Duration {
        match *self {
            Self::Regular { interval } => interval.saturating_mul(step),
            Self::Fibonacci { unit, cap_index } => fibonacci_backoff(step, cap_index, unit),
        }
    }

    /// `count` upcoming timestamps (epoch ms) following `after_step`.
    ///
    /// The result is non-decreasing.
    pub fn upcoming(&self, now_ms: i64, after_step: u32, count: usize) -> Vec<i64> {
        (1..=count as u32)
            .map(|k| now_ms.saturating_add(duration_ms(self.offset(after_step.saturating_add(k)))))
            .collect()
    }

    /// Cap used to clamp the failure counter. Regular schedules are never capped.
    pub fn cap_index(&self) -> Option<u32> {
        match *self {
            Self::Regular { .. } => None,
            Self::Fibonacci { cap_index, .. } => Some(cap_index),
        }
    }
}

/// Scheduling state persisted on each perpetual task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingVector {
    /// Upcoming assigner retry timestamps (epoch ms), non-decreasing.
    pub assigner_iterations: Vec<i64>,

    /// Next rebalance timestamp (epoch ms). Zero when no rebalance is pending.
    pub rebalance_iteration: i64,

    /// Consecutive failed assignment attempts, clamped at the backoff cap.
    pub assign_try_count: u32,

    /// Do not attempt assignment before this instant (epoch ms).
    pub assign_after_ms: i64,
}

impl SchedulingVector {
    /// Record a failed assignment attempt made at `now_ms`.
    ///
    /// Increments the try count (clamped), pushes `assign_after_ms` out by the
    /// backoff for the new count and refreshes the upcoming assigner
    /// iterations. Returns the new `assign_after_ms`.
    pub fn record_failure(&mut self, now_ms: i64, strategy: &IterationStrategy, horizon: usize) -> i64 {
        let next = self.assign_try_count.saturating_add(1);
        self.assign_try_count = match strategy.cap_index() {
            Some(cap) => next.min(cap),
            None => next,
        };
        self.assign_after_ms = now_ms.saturating_add(duration_ms(strategy.offset(self.assign_try_count)));
        // First entry equals assign_after_ms.
        self.assigner_iterations =
            strategy.upcoming(now_ms, self.assign_try_count.saturating_sub(1), horizon.max(1));
        self.assign_after_ms
    }

    /// Make the task immediately eligible for a rebalance pass.
    pub fn schedule_rebalance(&mut self, now_ms: i64) {
        self.rebalance_iteration = now_ms;
    }
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MINUTE_MS: i64 = 60_000;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(2, 1)]
    #[case(3, 2)]
    #[case(4, 3)]
    #[case(5, 5)]
    #[case(8, 21)]
    fn fibonacci_sequence(#[case] n: u32, #[case] expected: u64) {
        assert_eq!(fibonacci(n), expected);
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let unit = Duration::from_secs(60);
        let delays: Vec<Duration> = (0..20).map(|n| fibonacci_backoff(n, 8, unit)).collect();

        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[8], Duration::from_secs(21 * 60));
        assert!(delays[8..].iter().all(|d| *d == delays[8]));
    }

    #[test]
    fn first_failure_waits_one_unit() {
        let mut vector = SchedulingVector::default();
        let now = 1_000_000;

        let after = vector.record_failure(now, &IterationStrategy::fibonacci_default(), 3);

        assert_eq!(vector.assign_try_count, 1);
        assert_eq!(after, now + MINUTE_MS);
        assert_eq!(vector.assign_after_ms, after);
        assert_eq!(vector.assigner_iterations.first(), Some(&after));
    }

    #[test]
    fn try_count_stays_at_cap() {
        let mut vector = SchedulingVector::default();
        let strategy = IterationStrategy::fibonacci_default();
        for _ in 0..15 {
            vector.record_failure(0, &strategy, 3);
        }
        assert_eq!(vector.assign_try_count, DEFAULT_BACKOFF_CAP_INDEX);
        assert_eq!(vector.assign_after_ms, 21 * MINUTE_MS);
    }

    #[test]
    fn assigner_iterations_are_ordered() {
        let mut vector = SchedulingVector::default();
        let strategy = IterationStrategy::fibonacci_default();
        vector.record_failure(0, &strategy, 4);
        vector.record_failure(0, &strategy, 4);

        let iterations = &vector.assigner_iterations;
        assert!(!iterations.is_empty());
        assert!(iterations.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn rebalance_leaves_backoff_alone() {
        let mut vector = SchedulingVector::default();
        vector.record_failure(10, &IterationStrategy::fibonacci_default(), 3);

        vector.schedule_rebalance(500);

        assert_eq!(vector.rebalance_iteration, 500);
        assert_eq!(vector.assign_try_count, 1);
    }

    #[test]
    fn regular_strategy_spaces_evenly() {
        let strategy = IterationStrategy::Regular {
            interval: Duration::from_secs(10),
        };
        assert_eq!(strategy.upcoming(0, 0, 3), vec![10_000, 20_000, 30_000]);
        assert_eq!(strategy.cap_index(), None);
    }
}
