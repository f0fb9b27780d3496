//! The runtime object.
//!
//! [`SsrRuntime`] holds everything a request needs (page cache, metrics,
//! request monitor, proxy handler, renderer, access log) and is passed
//! around as an `Arc`. Both the dev server and the Lambda handler drive
//! requests through [`SsrRuntime::handle`].

use arc_swap::ArcSwap;
use bytes::Bytes;
use hyper::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_TYPE, COOKIE, REFERER, USER_AGENT,
};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::{
    CachePredicate, CacheStore, FilesystemStore, KeyOptions, MemoryStore, PageCache,
};
use crate::compression::accepts_gzip;
use crate::config::{AppConfig, StoreKind};
use crate::encoding::decode_encoded_headers;
use crate::error::Result;
use crate::headers::{header_str, X_LOOPBACK, X_NO_CACHE, X_PROXY_REQUEST_URL};
use crate::metrics::Metrics;
use crate::monitor::{RequestMonitor, ResponseTracker};
use crate::proxy::client::{
    init_shared_client, HyperUpstreamClient, LoopbackClient, UpstreamClient,
};
use crate::proxy::config::ProxyTable;
use crate::proxy::ProxyHandler;
use crate::render::{Renderer, StaticSiteRenderer};
use crate::response::{text_response, ResponseBody, ResponseWriter};
use crate::telemetry::access_log::{
    log_timestamp, AccessLogEntry, AccessLogger, CacheStatus, LogFormat,
};

/// Prometheus text exposition of the runtime's metrics.
pub const METRICS_PATH: &str = "/__ssr/metrics";

/// Liveness probe.
pub const HEALTH_PATH: &str = "/__ssr/healthz";

/// Upper bound Moka keeps a page when the cache itself has no TTL.
const MAX_MEMORY_TTL_SECS: u64 = 24 * 60 * 60;

/// Per-request facts kept for the access log after the request is consumed.
struct RequestInfo {
    start: Instant,
    id: String,
    method: Method,
    path: String,
    client_ip: String,
    referer: String,
    user_agent: String,
}

impl RequestInfo {
    fn new(id: String, req: &Request<Bytes>) -> Self {
        let header = |name: &str| header_str(req.headers(), name).unwrap_or("").to_string();
        Self {
            start: Instant::now(),
            id,
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            client_ip: req
                .extensions()
                .get::<SocketAddr>()
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| "-".to_string()),
            referer: header(REFERER.as_str()),
            user_agent: header(USER_AGENT.as_str()),
        }
    }
}

/// The SSR runtime: explicit owner of the cache, metrics and monitor.
pub struct SsrRuntime {
    config: Arc<AppConfig>,
    cache: Option<PageCache>,
    metrics: Arc<Metrics>,
    monitor: Arc<RequestMonitor>,
    proxy: ProxyHandler,
    renderer: Arc<dyn Renderer>,
    access_log: Option<Arc<AccessLogger>>,
    next_id: AtomicU64,
}

impl SsrRuntime {
    pub fn builder(config: AppConfig) -> SsrRuntimeBuilder {
        SsrRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn monitor(&self) -> &Arc<RequestMonitor> {
        &self.monitor
    }

    /// The page cache, unless caching is disabled.
    pub fn cache(&self) -> Option<&PageCache> {
        self.cache.as_ref()
    }

    /// The live proxy table, for the reload handler.
    pub fn proxies(&self) -> &Arc<ArcSwap<ProxyTable>> {
        self.proxy.proxies()
    }

    /// Runs store housekeeping, if there is a store.
    pub async fn housekeeping(&self) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.store().housekeeping().await,
            None => Ok(()),
        }
    }

    /// Handles one request end to end.
    ///
    /// Proxy routes go upstream. Everything else is looked up in the page
    /// cache and, on a miss, rendered in a background task while the
    /// response streams back. The returned response is available as soon
    /// as its headers are.
    pub async fn handle(&self, mut req: Request<Bytes>) -> Response<ResponseBody> {
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        decode_encoded_headers(req.headers_mut());
        let info = RequestInfo::new(id, &req);

        match info.path.as_str() {
            HEALTH_PATH => return text_response(StatusCode::OK, "ok"),
            METRICS_PATH => {
                let mut resp = text_response(StatusCode::OK, self.metrics.encode());
                resp.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                return resp;
            }
            _ => {}
        }

        let tracker = self.monitor.track(info.id.clone());
        let req = match self.proxy.handle(req).await {
            Ok(resp) => {
                tracker.finish();
                let upstream = header_str(resp.headers(), X_PROXY_REQUEST_URL)
                    .unwrap_or("")
                    .to_string();
                self.finish_request(&info, resp.status(), CacheStatus::Proxy, upstream);
                return resp;
            }
            Err(req) => req,
        };

        self.render_page(req, info, tracker).await
    }

    async fn render_page(
        &self,
        mut req: Request<Bytes>,
        info: RequestInfo,
        tracker: ResponseTracker,
    ) -> Response<ResponseBody> {
        let allow_cookies = self.config.allow_cookies;
        if !allow_cookies && req.headers_mut().remove(COOKIE).is_some() {
            debug!("Stripped Cookie from {} {}", info.method, info.path);
        }
        if req.headers().contains_key(X_LOOPBACK) {
            debug!("Loopback request {} {}", info.method, info.path);
        }

        let (res, pending) = ResponseWriter::new(info.id.clone(), allow_cookies);
        let mut res = res.with_tracker(tracker);

        let cache_status = match &self.cache {
            Some(_) if req.headers().contains_key(X_NO_CACHE) => {
                res.disable_cache();
                CacheStatus::Bypass
            }
            Some(cache) if PageCache::is_cacheable_method(req.method()) => {
                let mut extras = Vec::new();
                if accepts_gzip(header_str(req.headers(), ACCEPT_ENCODING.as_str())) {
                    extras.push("gzip".to_string());
                }
                let key = cache.generate_cache_key(&req, &extras);
                let cached = cache.get_response_from_cache(&key).await;
                if cached.found() {
                    if let Err(e) = cached.send(&mut res) {
                        error!("Failed to replay cached {}: {}", key, e);
                        drop(res);
                        let resp = text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal Server Error",
                        );
                        self.finish_request(
                            &info,
                            resp.status(),
                            CacheStatus::Hit,
                            String::new(),
                        );
                        return resp;
                    }
                    let resp = pending.into_response().await;
                    self.finish_request(&info, resp.status(), CacheStatus::Hit, String::new());
                    return resp;
                }
                match cache.cache_response_when_done(&req, key, &mut res) {
                    Ok(()) => CacheStatus::Miss,
                    Err(e) => {
                        warn!("Not caching {}: {}", info.path, e);
                        CacheStatus::Bypass
                    }
                }
            }
            _ => CacheStatus::Bypass,
        };

        let renderer = Arc::clone(&self.renderer);
        let path = info.path.clone();
        tokio::spawn(async move {
            let result = renderer.render(&req, &mut res).await;
            if let Err(e) = result {
                error!("Render of {} failed: {}", path, e);
                res.disable_cache();
                if !res.headers_sent() {
                    let _ = res.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                    let _ = res.set_header("content-type", "text/plain; charset=utf-8");
                    let _ = res.write("Internal Server Error");
                }
                if !res.is_finished() {
                    let _ = res.end();
                }
            } else if !res.is_finished() {
                warn!("Renderer returned without ending {}", path);
                let _ = res.end();
            }
        });

        let resp = pending.into_response().await;
        self.finish_request(&info, resp.status(), cache_status, String::new());
        resp
    }

    fn finish_request(
        &self,
        info: &RequestInfo,
        status: StatusCode,
        cache: CacheStatus,
        upstream: String,
    ) {
        let elapsed = info.start.elapsed();
        self.metrics
            .observe_request(kind_label(cache), status.as_u16(), elapsed);
        if let Some(log) = &self.access_log {
            log.log(AccessLogEntry {
                timestamp: log_timestamp(),
                request_id: info.id.clone(),
                client_ip: info.client_ip.clone(),
                method: info.method.to_string(),
                path: info.path.clone(),
                status: status.as_u16(),
                latency_ms: elapsed.as_millis() as u64,
                cache,
                upstream,
                referer: info.referer.clone(),
                user_agent: info.user_agent.clone(),
            });
        }
    }
}

fn kind_label(cache: CacheStatus) -> &'static str {
    match cache {
        CacheStatus::Hit => "cache",
        CacheStatus::Miss | CacheStatus::Bypass => "render",
        CacheStatus::Proxy => "proxy",
    }
}

/// Assembles an [`SsrRuntime`]. Anything not supplied is built from the
/// configuration.
pub struct SsrRuntimeBuilder {
    config: AppConfig,
    store: Option<Arc<dyn CacheStore>>,
    metrics: Option<Arc<Metrics>>,
    monitor: Option<Arc<RequestMonitor>>,
    client: Option<Arc<dyn UpstreamClient>>,
    renderer: Option<Arc<dyn Renderer>>,
    proxies: Option<Arc<ArcSwap<ProxyTable>>>,
    access_log: Option<Arc<AccessLogger>>,
    predicate: Option<CachePredicate>,
}

impl SsrRuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            metrics: None,
            monitor: None,
            client: None,
            renderer: None,
            proxies: None,
            access_log: None,
            predicate: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn monitor(mut self, monitor: Arc<RequestMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn upstream_client(mut self, client: Arc<dyn UpstreamClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn proxies(mut self, proxies: Arc<ArcSwap<ProxyTable>>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn access_log(mut self, log: Arc<AccessLogger>) -> Self {
        self.access_log = Some(log);
        self
    }

    /// Replaces the default 2xx-only cacheability policy.
    pub fn cache_predicate(mut self, predicate: CachePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Validates the configuration and builds the runtime. Must run inside
    /// a Tokio runtime.
    pub async fn build(self) -> Result<Arc<SsrRuntime>> {
        let config = self.config;
        config.validate()?;

        let metrics = self.metrics.unwrap_or_default();
        let monitor = self.monitor.unwrap_or_default();

        let cache = if config.cache.enabled {
            let store: Arc<dyn CacheStore> = match self.store {
                Some(store) => store,
                None => match config.cache.store {
                    StoreKind::Memory => Arc::new(MemoryStore::new(
                        config.cache.max_entries,
                        config.cache.ttl_secs.unwrap_or(MAX_MEMORY_TTL_SECS),
                    )),
                    StoreKind::Filesystem => {
                        Arc::new(FilesystemStore::new(&config.cache.dir).await?)
                    }
                },
            };
            info!(
                "Page cache enabled: {} store, namespace '{}'",
                store.name(),
                config.cache.namespace
            );
            let mut cache = PageCache::new(store, Arc::clone(&metrics), Arc::clone(&monitor))
                .with_namespace(config.cache.namespace.clone())
                .with_ttl(config.cache.ttl_secs)
                .with_key_options(KeyOptions {
                    ignore_device_type: config.cache.ignore_device_type,
                    ignore_request_class: config.cache.ignore_request_class,
                    extras: Vec::new(),
                });
            if let Some(predicate) = self.predicate {
                cache = cache.with_predicate(predicate);
            }
            Some(cache)
        } else {
            info!("Page cache disabled");
            None
        };

        let client = match self.client {
            Some(client) => client,
            None => {
                let timeout = Duration::from_secs(config.upstream_timeout_secs);
                let app_host = config.app_hostname.clone();
                init_shared_client(move || {
                    let inner: Arc<dyn UpstreamClient> =
                        Arc::new(HyperUpstreamClient::new(timeout)?);
                    let loopback = LoopbackClient::new(inner, app_host).with_header(
                        HeaderName::from_static(X_LOOPBACK),
                        HeaderValue::from_static("true"),
                    );
                    Ok(Arc::new(loopback) as Arc<dyn UpstreamClient>)
                })?
            }
        };

        let proxies = match self.proxies {
            Some(proxies) => proxies,
            None => Arc::new(ArcSwap::from_pointee(ProxyTable::new(config.proxies.clone())?)),
        };
        let proxy = ProxyHandler::new(
            proxies,
            client,
            Arc::clone(&metrics),
            config.app_hostname.clone(),
            config.app_origin(),
        );

        let renderer = self.renderer.unwrap_or_else(|| {
            Arc::new(StaticSiteRenderer::new(&config.static_root).with_gzip(config.gzip))
        });

        let access_log = self.access_log.or_else(|| {
            config.access_log_path.as_deref().map(|path| {
                let format =
                    LogFormat::parse(config.access_log_format.as_deref().unwrap_or("json"));
                Arc::new(AccessLogger::new(path, format))
            })
        });

        if config.allow_cookies {
            debug!("Cookies are allowed on rendered pages");
        }

        Ok(Arc::new(SsrRuntime {
            config: Arc::new(config),
            cache,
            metrics,
            monitor,
            proxy,
            renderer,
            access_log,
            next_id: AtomicU64::new(1),
        }))
    }
}
