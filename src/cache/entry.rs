//! Cache entries and their replay onto a response.

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::capture::Chunk;
use crate::error::{Error, Result};
use crate::headers::{HOP_BY_HOP, X_FROM_CACHE};
use crate::response::ResponseWriter;

/// Headers never written into a cached snapshot.
const SNAPSHOT_EXCLUDED: &[&str] = &["date", X_FROM_CACHE];

fn default_status() -> u16 {
    200
}

/// A stored header value: one string, or several for repeated headers such
/// as `set-cookie`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderEntry {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderEntry {
    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderEntry::Single(value) => vec![value.as_str()],
            HeaderEntry::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// Status and headers of a stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderEntry>,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: BTreeMap::new(),
        }
    }
}

impl EntryMetadata {
    /// Snapshots a finished response for storage. Hop-by-hop headers, `date`
    /// and the from-cache marker are left out; everything else, including
    /// every `set-cookie` value, is kept.
    pub fn snapshot(status: StatusCode, headers: &HeaderMap) -> Self {
        let mut stored = BTreeMap::new();
        for name in headers.keys() {
            let name_str = name.as_str();
            if HOP_BY_HOP.contains(&name_str) || SNAPSHOT_EXCLUDED.contains(&name_str) {
                continue;
            }
            let mut values: Vec<String> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| match v.to_str() {
                    Ok(s) => Some(s.to_string()),
                    Err(_) => {
                        debug!("Not caching non-ASCII value of header {}", name_str);
                        None
                    }
                })
                .collect();
            let entry = match values.len() {
                0 => continue,
                1 => HeaderEntry::Single(values.remove(0)),
                _ => HeaderEntry::Multiple(values),
            };
            stored.insert(name_str.to_string(), entry);
        }
        Self {
            status: status.as_u16(),
            headers: stored,
        }
    }
}

/// A possibly partial record returned by a store lookup.
#[derive(Debug, Clone, Default)]
pub struct CacheRecord {
    pub found: bool,
    pub data: Option<Bytes>,
    pub metadata: Option<EntryMetadata>,
    pub expiration: Option<SystemTime>,
}

impl CacheRecord {
    pub fn miss() -> Self {
        Self::default()
    }
}

/// A write handed to a store.
#[derive(Debug, Clone)]
pub struct CacheWrite {
    pub key: String,
    pub namespace: String,
    pub data: Option<Bytes>,
    pub metadata: EntryMetadata,
    pub expiration_seconds: Option<u64>,
}

impl CacheWrite {
    /// Absolute expiry computed from `now`. A lifetime past the end of
    /// representable time means no expiry.
    pub fn expires_at(&self, now: SystemTime) -> Option<SystemTime> {
        self.expiration_seconds
            .and_then(|secs| now.checked_add(Duration::from_secs(secs)))
    }
}

/// The result of one cache lookup.
///
/// Built fresh for every lookup and never mutated. When `found` is false
/// the data, metadata and expiration are always the defaults, whatever the
/// store returned.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    found: bool,
    key: String,
    namespace: String,
    data: Option<Bytes>,
    metadata: EntryMetadata,
    expiration: Option<SystemTime>,
}

impl CachedResponse {
    pub fn new(key: impl Into<String>, namespace: impl Into<String>, record: CacheRecord) -> Self {
        let (data, metadata, expiration) = if record.found {
            (
                record.data.filter(|d| !d.is_empty()),
                record.metadata.unwrap_or_default(),
                record.expiration,
            )
        } else {
            (None, EntryMetadata::default(), None)
        };
        Self {
            found: record.found,
            key: key.into(),
            namespace: namespace.into(),
            data,
            metadata,
            expiration,
        }
    }

    pub fn not_found(key: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::new(key, namespace, CacheRecord::miss())
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status(&self) -> u16 {
        self.metadata.status
    }

    pub fn headers(&self) -> &BTreeMap<String, HeaderEntry> {
        &self.metadata.headers
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn expiration(&self) -> Option<SystemTime> {
        self.expiration
    }

    /// Replays this entry: status, every stored header, the from-cache
    /// marker, then the stored bytes as one binary chunk.
    ///
    /// Fails with [`Error::CacheEntryNotFound`] when the lookup missed.
    pub fn send(&self, res: &mut ResponseWriter) -> Result<()> {
        if !self.found {
            return Err(Error::CacheEntryNotFound {
                key: self.key.clone(),
            });
        }

        let status = StatusCode::from_u16(self.metadata.status).map_err(hyper::http::Error::from)?;
        res.set_status(status)?;

        for (name, entry) in &self.metadata.headers {
            let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                warn!("Skipping cached header with invalid name '{}'", name);
                continue;
            };
            let values: Vec<HeaderValue> = entry
                .values()
                .into_iter()
                .filter_map(|v| HeaderValue::from_str(v).ok())
                .collect();
            res.remove_header(name)?;
            for value in values {
                res.append_header(header.clone(), value)?;
            }
        }
        res.insert_header(
            HeaderName::from_static(X_FROM_CACHE),
            HeaderValue::from_static("true"),
        )?;

        if let Some(data) = &self.data {
            res.write(Chunk::Binary(data.clone()))?;
        }
        res.end()
    }
}
