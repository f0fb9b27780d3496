//! The persistent store behind the page cache.

use async_trait::async_trait;

use super::entry::{CacheRecord, CacheWrite};
use crate::error::Result;

/// A key/value store for page cache entries, partitioned by namespace.
///
/// Stores are shared across requests without extra locking; whatever
/// atomicity they provide per key (last write wins) is all callers get.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Looks up `key`. A missing or expired entry is `Ok` with `found` unset.
    async fn get(&self, key: &str, namespace: &str) -> Result<CacheRecord>;

    /// Stores an entry, replacing any previous one under the same key.
    async fn put(&self, entry: CacheWrite) -> Result<()>;

    /// Removes an entry. Returns whether one existed.
    async fn delete(&self, key: &str, namespace: &str) -> Result<bool>;

    /// Reclaims space held by expired or evicted entries.
    async fn housekeeping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}
