//! Domain - ドメインモデル
//!
//! ids, perpetual tasks, scheduling vectors, locks, queue messages, errors.

pub mod errors;
pub mod ids;
pub mod lock;
pub mod message;
pub mod scheduling;
pub mod task;

pub use errors::{HandlerError, LockError, QueueError, RegistryError, StoreError};
pub use ids::{DelegateId, LockOwnerId, MessageId, PerpetualTaskId};
pub use lock::LockRecord;
pub use message::{QueueFilter, QueueMessage, StoredMessage};
pub use scheduling::{IterationStrategy, SchedulingVector, fibonacci, fibonacci_backoff};
pub use task::{ClientContext, NewPerpetualTask, PerpetualTaskRecord, TaskState, UnassignedReason};
