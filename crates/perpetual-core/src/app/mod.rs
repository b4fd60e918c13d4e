//! App: services composed from the ports.
//!
//! - **PerpetualTaskRegistry**: task intake and delegate-facing queries
//! - **AssignmentScheduler**: periodic assignment/rebalance passes
//! - **HeartbeatMonitor**: heartbeats, failure counts, delegate departure

pub mod heartbeat;
pub mod registry;
pub mod scheduler;

pub use self::heartbeat::HeartbeatMonitor;
pub use self::registry::PerpetualTaskRegistry;
pub use self::scheduler::{AssignmentScheduler, PassReport, SchedulerHandle, SchedulerSettings};
