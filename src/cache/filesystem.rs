//! Filesystem-backed page cache.
//!
//! Layout: `<base_dir>/<namespace>/<sha256(key)>.json` holds the key,
//! metadata and expiry; `<sha256(key)>.body` holds the raw bytes. Files are
//! written to a temporary name and renamed, so readers never see a torn
//! entry and the last writer wins.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

use super::entry::{CacheRecord, CacheWrite, EntryMetadata};
use super::store::CacheStore;
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    key: String,
    metadata: EntryMetadata,
    /// Seconds since the Unix epoch.
    expires_at: Option<u64>,
    has_body: bool,
}

impl StoredMeta {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at
            .and_then(epoch_secs)
            .is_some_and(|at| at <= now)
    }
}

fn epoch_secs(secs: u64) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}

/// Page cache persisted under a directory.
pub struct FilesystemStore {
    base_dir: PathBuf,
}

impl FilesystemStore {
    /// Opens (and creates if needed) a store rooted at `base_dir`.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| Error::store(format!("cannot create {:?}: {}", base_dir, e)))?;
        debug!("Initialized filesystem cache at: {:?}", base_dir);
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        let safe: String = namespace
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(if safe.is_empty() { "_" } else { &safe })
    }

    fn entry_paths(&self, key: &str, namespace: &str) -> (PathBuf, PathBuf) {
        let digest: String = Sha256::digest(key.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        let dir = self.namespace_dir(namespace);
        (
            dir.join(format!("{}.json", digest)),
            dir.join(format!("{}.body", digest)),
        )
    }

    async fn read_meta(path: &Path) -> Result<Option<StoredMeta>> {
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| Error::store(format!("corrupt entry {:?}: {}", path, e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::store(format!("cannot read {:?}: {}", path, e))),
        }
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("")
        ));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::store(format!("cannot write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::store(format!("cannot rename {:?}: {}", tmp, e)))
    }

    async fn remove_if_present(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::store(format!("cannot remove {:?}: {}", path, e))),
        }
    }
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn get(&self, key: &str, namespace: &str) -> Result<CacheRecord> {
        let (meta_path, body_path) = self.entry_paths(key, namespace);
        let Some(meta) = Self::read_meta(&meta_path).await? else {
            return Ok(CacheRecord::miss());
        };
        if meta.key != key {
            debug!("Cache digest collision on {}: stored {}", key, meta.key);
            return Ok(CacheRecord::miss());
        }
        if meta.is_expired(SystemTime::now()) {
            trace!("Removing expired cache entry: {}/{}", namespace, key);
            Self::remove_if_present(&meta_path).await?;
            Self::remove_if_present(&body_path).await?;
            return Ok(CacheRecord::miss());
        }

        let data = if meta.has_body {
            match tokio::fs::read(&body_path).await {
                Ok(raw) => Some(Bytes::from(raw)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::store(format!("entry {} lost its body", key)));
                }
                Err(e) => return Err(Error::store(format!("cannot read {:?}: {}", body_path, e))),
            }
        } else {
            None
        };

        Ok(CacheRecord {
            found: true,
            data,
            expiration: meta.expires_at.and_then(epoch_secs),
            metadata: Some(meta.metadata),
        })
    }

    async fn put(&self, entry: CacheWrite) -> Result<()> {
        let (meta_path, body_path) = self.entry_paths(&entry.key, &entry.namespace);
        if let Some(parent) = meta_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::store(format!("cannot create {:?}: {}", parent, e)))?;
        }

        let expires_at = entry
            .expires_at(SystemTime::now())
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        let has_body = entry.data.is_some();
        match &entry.data {
            Some(data) => Self::write_atomic(&body_path, data).await?,
            None => {
                Self::remove_if_present(&body_path).await?;
            }
        }

        trace!(
            "Writing cache entry {}/{} ({} bytes)",
            entry.namespace,
            entry.key,
            entry.data.as_ref().map_or(0, Bytes::len)
        );
        let meta = StoredMeta {
            key: entry.key,
            metadata: entry.metadata,
            expires_at,
            has_body,
        };
        Self::write_atomic(&meta_path, &serde_json::to_vec(&meta)?).await
    }

    async fn delete(&self, key: &str, namespace: &str) -> Result<bool> {
        let (meta_path, body_path) = self.entry_paths(key, namespace);
        let existed = Self::remove_if_present(&meta_path).await?;
        Self::remove_if_present(&body_path).await?;
        Ok(existed)
    }

    /// Deletes every expired entry in every namespace.
    async fn housekeeping(&self) -> Result<()> {
        let now = SystemTime::now();
        let mut removed = 0usize;
        let mut namespaces = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(ns) = namespaces.next_entry().await? {
            if !ns.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(ns.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                // Unreadable entries are left for `get` to report.
                let Ok(Some(meta)) = Self::read_meta(&path).await else {
                    continue;
                };
                if meta.is_expired(now) {
                    Self::remove_if_present(&path).await?;
                    Self::remove_if_present(&path.with_extension("body")).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("Filesystem cache housekeeping removed {} entries", removed);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}
