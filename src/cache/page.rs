//! Page cache read/write orchestration.
//!
//! A page request is looked up once. A hit is replayed without rendering;
//! on a miss the render proceeds with capture installed, and once the
//! response ends normally its bytes are stored if the request did not opt
//! out and the cacheability predicate accepts it. The store write runs in
//! the background under its own monitor entry, so the client never waits
//! on it but the container does.

use hyper::header::HeaderMap;
use hyper::{Method, Request, Uri};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::entry::{CacheWrite, CachedResponse, EntryMetadata};
use super::key::{generate_cache_key, KeyOptions};
use super::store::CacheStore;
use crate::error::Result;
use crate::metrics::{MetricName, Metrics};
use crate::monitor::RequestMonitor;
use crate::response::{FinishedResponse, ResponseWriter};

/// The parts of a request a cacheability predicate may inspect.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl CacheRequest {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        }
    }
}

/// Decides whether a finished response is stored.
pub type CachePredicate = Arc<dyn Fn(&CacheRequest, &FinishedResponse) -> bool + Send + Sync>;

/// Stores successful (2xx) responses only.
pub fn success_only(_req: &CacheRequest, res: &FinishedResponse) -> bool {
    res.status.is_success()
}

/// Page cache bound to one store and namespace.
pub struct PageCache {
    store: Arc<dyn CacheStore>,
    metrics: Arc<Metrics>,
    monitor: Arc<RequestMonitor>,
    namespace: String,
    ttl_secs: Option<u64>,
    key_options: KeyOptions,
    should_cache: CachePredicate,
}

impl PageCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        metrics: Arc<Metrics>,
        monitor: Arc<RequestMonitor>,
    ) -> Self {
        Self {
            store,
            metrics,
            monitor,
            namespace: "pages".to_string(),
            ttl_secs: None,
            key_options: KeyOptions::default(),
            should_cache: Arc::new(success_only),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ttl(mut self, ttl_secs: Option<u64>) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_key_options(mut self, options: KeyOptions) -> Self {
        self.key_options = options;
        self
    }

    pub fn with_predicate(mut self, predicate: CachePredicate) -> Self {
        self.should_cache = predicate;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Only `GET` responses are looked up or stored.
    pub fn is_cacheable_method(method: &Method) -> bool {
        method == Method::GET
    }

    /// Derives the key for `req`, folding in `extras` after any configured
    /// ones.
    pub fn generate_cache_key<B>(&self, req: &Request<B>, extras: &[String]) -> String {
        let mut options = self.key_options.clone();
        options.extras.extend_from_slice(extras);
        generate_cache_key(req.uri(), req.headers(), &options)
    }

    /// Looks `key` up. Store failures are logged and reported as a miss.
    pub async fn get_response_from_cache(&self, key: &str) -> CachedResponse {
        match self.store.get(key, &self.namespace).await {
            Ok(record) => {
                let cached = CachedResponse::new(key, &self.namespace, record);
                if cached.found() {
                    debug!("Cache HIT: {}", key);
                    self.metrics
                        .send(MetricName::CacheHit, &[("namespace", self.namespace.as_str())]);
                } else {
                    debug!("Cache MISS: {}", key);
                    self.metrics
                        .send(MetricName::CacheMiss, &[("namespace", self.namespace.as_str())]);
                }
                cached
            }
            Err(e) => {
                warn!("Cache read for {} failed, treating as miss: {}", key, e);
                self.metrics
                    .send(MetricName::CacheReadFailed, &[("namespace", self.namespace.as_str())]);
                CachedResponse::not_found(key, &self.namespace)
            }
        }
    }

    /// Installs capture on `res` and arranges for the finished response to
    /// be stored under `key`.
    ///
    /// Nothing is stored if the response is dropped or the client
    /// disconnects, if the handler called [`ResponseWriter::disable_cache`],
    /// or if the predicate rejects it.
    pub fn cache_response_when_done<B>(
        &self,
        req: &Request<B>,
        key: String,
        res: &mut ResponseWriter,
    ) -> Result<()> {
        res.install_capture()?;

        let request = CacheRequest::from_request(req);
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let monitor = Arc::clone(&self.monitor);
        let should_cache = Arc::clone(&self.should_cache);
        let namespace = self.namespace.clone();
        let ttl_secs = self.ttl_secs;

        res.on_finish(move |finished| {
            if finished.no_cache {
                debug!("Not caching {}: disabled by handler", key);
                return;
            }
            if !should_cache(&request, finished) {
                debug!("Not caching {}: status {} rejected", key, finished.status);
                return;
            }
            let Ok(handle) = Handle::try_current() else {
                warn!("Not caching {}: no runtime to run the store write", key);
                return;
            };

            // Started before the response's own entry finishes, so the
            // monitor cannot drain between the two.
            let tracker = monitor.track(format!("{}:cache", finished.id));
            let write = CacheWrite {
                key,
                namespace,
                data: finished.body.clone().filter(|b| !b.is_empty()),
                metadata: EntryMetadata::snapshot(finished.status, &finished.headers),
                expiration_seconds: ttl_secs,
            };
            handle.spawn(async move {
                let key = write.key.clone();
                match store.put(write).await {
                    Ok(()) => debug!("Cached response under {}", key),
                    Err(e) => {
                        warn!("Failed to cache response under {}: {}", key, e);
                        metrics.send(MetricName::CacheStoreFailed, &[]);
                    }
                }
                tracker.finish();
            });
        });
        Ok(())
    }
}
