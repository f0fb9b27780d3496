//! Page response caching.
//!
//! [`entry`] defines what is stored, [`key`] how requests map onto keys,
//! [`store`] the persistence seam with its [`memory`] and [`filesystem`]
//! implementations, and [`page`] the per-request read/write flow.

pub mod entry;
pub mod filesystem;
pub mod key;
pub mod memory;
pub mod page;
pub mod store;

pub use entry::{CacheRecord, CacheWrite, CachedResponse, EntryMetadata, HeaderEntry};
pub use filesystem::FilesystemStore;
pub use key::{generate_cache_key, DeviceType, KeyOptions};
pub use memory::MemoryStore;
pub use page::{success_only, CachePredicate, CacheRequest, PageCache};
pub use store::CacheStore;
