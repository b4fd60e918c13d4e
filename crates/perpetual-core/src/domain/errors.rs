//! Errors - エラー型と分類
//!
//! 想定内の調停結果（ロック取得失敗、元オーナーからの heartbeat、
//! delegate 不在）はエラーではなく戻り値で表現します。
//! ここに残るのは本当に「失敗」と呼べるものだけです。
//!
//! # 分類
//! - `StoreError`: 永続化層の障害、ID 重複
//! - `LockError`: 取得失敗 / 待機タイムアウト / destroy 済み
//! - `RegistryError`: タスクが存在しない、または store 障害
//! - `QueueError`: store 障害、エンコード失敗、poison message

use std::time::Duration;

use thiserror::Error;

use super::ids::{MessageId, PerpetualTaskId};

/// Failure of the backing record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock {name}")]
    CouldNotAcquire { name: String },

    #[error("could not acquire lock {name} within {waited:?}")]
    WaitTimeout { name: String, waited: Duration },

    /// Raised after a lock record has been destroyed on purpose.
    #[error("lock {name} was destroyed; the critical section it guarded is no longer exclusive")]
    Destroyed { name: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("perpetual task {0} not found")]
    NotFound(PerpetualTaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The stored message could not be turned back into the consumer's type.
    /// The message has already been acknowledged.
    #[error("poison message {id} dropped: {source}")]
    Poison {
        id: MessageId,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Error returned by a queue handler. Triggers a requeue while retries remain.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
