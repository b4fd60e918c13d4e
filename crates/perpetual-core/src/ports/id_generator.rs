//! IdGenerator port.
//!
//! Ids are ULIDs whose timestamp part comes from the [`Clock`], so a test
//! driving a [`crate::ports::ManualClock`] gets ids that sort in test time.

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{Id, IdMarker, LockOwnerId, MessageId, PerpetualTaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> PerpetualTaskId;

    fn generate_message_id(&self) -> MessageId;

    fn generate_lock_owner(&self) -> LockOwnerId;
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = u64::try_from(self.clock.now_millis()).unwrap_or(0);
        Id::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> PerpetualTaskId {
        self.next()
    }

    fn generate_message_id(&self) -> MessageId {
        self.next()
    }

    fn generate_lock_owner(&self) -> LockOwnerId {
        self.next()
    }
}
