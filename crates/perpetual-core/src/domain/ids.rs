//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID + Phantom type
//! `Id<T>` は ULID を包むジェネリック型で、`T` は実行時には存在しない
//! マーカー型（PhantomData）。`PerpetualTaskId` と `MessageId` は混同できない。
//!
//! Every id is a ULID tagged with a zero-sized marker type, so a
//! `PerpetualTaskId` can never be passed where a `MessageId` is expected.
//! ULIDs sort by creation time, which the in-memory store relies on for
//! stable listing order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for id kinds. Supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when parsing an id from its display form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {prefix} id: {input}")]
pub struct ParseIdError {
    prefix: &'static str,
    input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed display form and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                prefix: T::prefix(),
                input: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PerpetualTask {}

impl IdMarker for PerpetualTask {
    fn prefix() -> &'static str {
        "pt-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockOwner {}

impl IdMarker for LockOwner {
    fn prefix() -> &'static str {
        "owner-"
    }
}

/// Identifier of a perpetual task record.
pub type PerpetualTaskId = Id<PerpetualTask>;

/// Identifier of a queue message.
pub type MessageId = Id<Message>;

/// Token identifying the holder of a lock acquisition.
pub type LockOwnerId = Id<LockOwner>;

/// Identifier of a delegate (worker process) in the fleet.
///
/// Delegates register themselves elsewhere, so this is an opaque string
/// rather than a ULID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelegateId(String);

impl DelegateId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DelegateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DelegateId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
