use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use std::time::{Duration, SystemTime};
use tracing::debug;

use super::entry::{CacheRecord, CacheWrite, EntryMetadata};
use super::store::CacheStore;
use crate::config::MAX_CACHE_TTL_SECS;
use crate::error::Result;

#[derive(Clone, Debug)]
struct StoredEntry {
    data: Option<Bytes>,
    metadata: EntryMetadata,
    expires_at: Option<SystemTime>,
}

/// An in-process store backed by Moka (a concurrent LFU cache).
///
/// Entries carry their own absolute expiry, checked on every read. The
/// cache-wide `max_ttl` only bounds how long Moka keeps anything at all.
pub struct MemoryStore {
    entries: Cache<String, StoredEntry>,
}

impl MemoryStore {
    pub fn new(max_capacity: u64, max_ttl_secs: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(Duration::from_secs(max_ttl_secs.clamp(1, MAX_CACHE_TTL_SECS)))
                .build(),
        }
    }

    fn entry_key(key: &str, namespace: &str) -> String {
        format!("{}\u{0}{}", namespace, key)
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str, namespace: &str) -> Result<CacheRecord> {
        let entry_key = Self::entry_key(key, namespace);
        let Some(entry) = self.entries.get(&entry_key).await else {
            return Ok(CacheRecord::miss());
        };
        if entry.expires_at.is_some_and(|at| SystemTime::now() >= at) {
            self.entries.invalidate(&entry_key).await;
            debug!("Cache entry expired: {}/{}", namespace, key);
            return Ok(CacheRecord::miss());
        }
        Ok(CacheRecord {
            found: true,
            data: entry.data,
            metadata: Some(entry.metadata),
            expiration: entry.expires_at,
        })
    }

    async fn put(&self, entry: CacheWrite) -> Result<()> {
        let expires_at = entry.expires_at(SystemTime::now());
        debug!(
            "Cache STORE: {}/{} ({} bytes)",
            entry.namespace,
            entry.key,
            entry.data.as_ref().map_or(0, Bytes::len)
        );
        self.entries
            .insert(
                Self::entry_key(&entry.key, &entry.namespace),
                StoredEntry {
                    data: entry.data,
                    metadata: entry.metadata,
                    expires_at,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str, namespace: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(&Self::entry_key(key, namespace))
            .await
            .is_some())
    }

    async fn housekeeping(&self) -> Result<()> {
        self.entries.run_pending_tasks().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
