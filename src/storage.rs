//! Ordered key-value storage.
//!
//! The queue layers on top of an embedded store that offers atomic single-key
//! writes and ordered range scans within a named partition. Two backends:
//! [`SqliteStore`] for durable queues and [`MemoryStore`] for tests and
//! queues that may be lost on restart.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;

/// Scan direction for [`KvStore::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Keys `>= from`, smallest first.
    Ascending,
    /// Keys `<= from`, largest first.
    Descending,
}

/// An embedded, crash-safe, ordered key-value store.
///
/// Every method is atomic on its own, including against other processes
/// sharing the same backing file. Nothing here spans keys, so callers that
/// need multi-key consistency must serialize access themselves.
pub trait KvStore: Send + Sync {
    fn get(&self, partition: &str, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite.
    fn put(&self, partition: &str, key: &str, value: &str) -> Result<()>;

    /// Insert only if `key` is absent. Returns whether the value was written.
    fn insert(&self, partition: &str, key: &str, value: &str) -> Result<bool>;

    /// Delete a key. Returns whether it existed.
    fn remove(&self, partition: &str, key: &str) -> Result<bool>;

    /// Number of keys in the partition.
    fn size(&self, partition: &str) -> Result<u64>;

    /// Delete every key in the partition.
    fn truncate(&self, partition: &str) -> Result<()>;

    /// Up to `limit` entries starting at `from` (inclusive), in key order.
    fn scan(
        &self,
        partition: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(String, String)>>;
}
