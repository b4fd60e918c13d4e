//! Ports - 外部との境界（trait）
//!
//! Traits at the seams to storage, time, id generation and the collaborators
//! this crate does not implement (delegate selection, leadership election).
//!
//! # 設計原則
//! - record store が唯一の正本（source of truth）。ここでは何もキャッシュしない
//! - プロセスをまたいで競合する書き込みはすべて条件付き

pub mod clock;
pub mod delegate_selector;
pub mod id_generator;
pub mod leadership;
pub mod lock_store;
pub mod queue_store;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::delegate_selector::DelegateSelector;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::leadership::{AlwaysPrimary, Leadership, LeadershipFlag};
pub use self::lock_store::{LockRequest, LockStore, TryLockOutcome};
pub use self::queue_store::QueueStore;
pub use self::task_store::{InsertOutcome, Patch, TaskFilter, TaskStore, TaskUpdate};
