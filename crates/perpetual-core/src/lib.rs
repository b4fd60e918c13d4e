//! perpetual-core
//!
//! Coordination primitives for a fleet of stateless workers ("delegates"):
//! perpetual-task assignment with heartbeats and rebalancing, a named
//! distributed lock, and a lease-based work queue.
//!
//! # Modules
//! - **domain**: records, ids, scheduling vectors, errors
//! - **ports**: traits at the store/clock/collaborator seams
//! - **impls**: in-memory store
//! - **lock**: `PersistentLocker` and `AcquiredLock`
//! - **app**: task registry, assignment scheduler, heartbeat monitor
//! - **queue**: publisher, consumer, listener, listener controller
//! - **config**: TOML configuration
//! - **observability**: status counts

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod lock;
pub mod observability;
pub mod ports;
pub mod queue;

#[cfg(test)]
mod test_support;
