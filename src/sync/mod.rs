//! The background engine that keeps the cache and the remote service in
//! sync: an initial hydration, a debounced pusher reacting to local
//! writes, a periodic conditional poller, and conflict reconciliation.
//!
//! Structured the way the teacher's `SyncEngine`/`SyncHandle` split is: a
//! cheap, cloneable [`SyncHandle`] sends commands over a channel to a
//! single background task that owns all mutable state, so callers never
//! contend on a lock to request a push or a shutdown.

mod engine;

pub use engine::{SyncEngine, SyncHandle};
