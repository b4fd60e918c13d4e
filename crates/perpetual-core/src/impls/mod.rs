//! Impls: concrete implementations of the ports.
//!
//! - **InMemoryRecordStore**: task, lock and queue store for tests, the CLI
//!   simulator and single-process deployments.
//!
//! A shared database backend would live in its own crate behind the same
//! traits.

pub mod memory;

pub use self::memory::InMemoryRecordStore;
