//! Two-tier caching in front of the network path.
//!
//! This module provides:
//! - A permanent tier backed by durable storage (SQLite), never auto-evicted
//! - An ephemeral in-memory tier with per-entry TTLs, a periodic sweep and an
//!   entry bound that evicts by insertion order
//! - A per-query-kind TTL table supplied at construction

mod ephemeral;
mod layer;
mod storage;
mod traits;

pub use ephemeral::EphemeralStore;
pub use layer::CacheStore;
pub use storage::{DurableStorage, NoopStorage, SqliteStorage, StoredRecord};
pub use traits::{CacheEntry, Tier, TierStats, TtlPolicy};
