//! InMemory record store - テスト・デモ用の実装
//!
//! 1 つの struct で 3 つの store port（task / lock / queue）をすべて実装します。
//! 1 つの DB が 3 つのコレクションを持つ構成に対応しています。
//!
//! # 原子性
//! - コレクションごとに mutex を 1 つ持つ
//! - trait メソッドは mutex を 1 回だけ取る。よって各呼び出しは互いに原子的

mod locks;
mod queue;
mod tasks;

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::domain::{LockRecord, MessageId, PerpetualTaskId, PerpetualTaskRecord, StoredMessage};

#[derive(Default)]
pub struct InMemoryRecordStore {
    tasks: Mutex<HashMap<PerpetualTaskId, PerpetualTaskRecord>>,
    locks: Mutex<HashMap<String, LockRecord>>,
    queue: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    messages: HashMap<MessageId, QueuedEntry>,
    next_seq: u64,
}

struct QueuedEntry {
    /// Insertion order, tie-breaker for messages with equal `earliest_get`.
    seq: u64,
    message: StoredMessage,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}
