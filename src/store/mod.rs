//! Persistent key-value store used for cycle state, snapshots and
//! execution records.
//!
//! Two backends: [`MemoryStore`] for tests and dry runs, [`SqliteStore`]
//! for the daemon. Both give the same semantics, including a sorted set
//! whose ties are broken by first insertion.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::errors::StoreError;

/// Key-value operations the lifecycle relies on.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Write several keys in one transaction.
    async fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), StoreError>;

    /// Remove a plain key or a sorted set.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increment an integer key (missing counts as 0) and return
    /// the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Add or update members. A member keeps its original insertion order
    /// when its score is updated.
    async fn sorted_set_add(&self, key: &str, entries: Vec<(String, f64)>)
    -> Result<(), StoreError>;

    /// Highest scores first; equal scores in insertion order.
    async fn sorted_set_top_n(&self, key: &str, n: usize)
    -> Result<Vec<(String, f64)>, StoreError>;

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError>;
}
