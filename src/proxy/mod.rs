//! Proxying of `/__proxy/<path>` and `/__caching/<path>` routes to their
//! configured upstreams.
//!
//! Header rewriting lives in [`headers`], target resolution in [`config`]
//! and the outbound transport in [`client`]. [`ProxyHandler`] ties them
//! together for one request.

pub mod client;
pub mod config;
pub mod headers;

use arc_swap::ArcSwap;
use bytes::Bytes;
use hyper::header::{HeaderValue, ALLOW};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::sync::Arc;
use tracing::{debug, error, warn};

use self::client::UpstreamClient;
use self::config::{ProxyKind, ProxyMatch, ProxyTable};
use self::headers::{rewrite_request_headers, rewrite_response_headers, RewriteContext};
use crate::error::Error;
use crate::headers::X_PROXY_REQUEST_URL;
use crate::metrics::{MetricName, Metrics};
use crate::response::{full_body, text_response, ResponseBody};

/// Methods a caching proxy route forwards.
pub const CACHING_PROXY_METHODS: &[Method] = &[Method::GET, Method::HEAD, Method::OPTIONS];

/// Forwards matched requests upstream and rewrites the exchange.
pub struct ProxyHandler {
    proxies: Arc<ArcSwap<ProxyTable>>,
    client: Arc<dyn UpstreamClient>,
    metrics: Arc<Metrics>,
    app_host: String,
    app_origin: String,
}

impl ProxyHandler {
    pub fn new(
        proxies: Arc<ArcSwap<ProxyTable>>,
        client: Arc<dyn UpstreamClient>,
        metrics: Arc<Metrics>,
        app_host: impl Into<String>,
        app_origin: impl Into<String>,
    ) -> Self {
        Self {
            proxies,
            client,
            metrics,
            app_host: app_host.into(),
            app_origin: app_origin.into(),
        }
    }

    /// The live proxy table, shared with the reload handler.
    pub fn proxies(&self) -> &Arc<ArcSwap<ProxyTable>> {
        &self.proxies
    }

    /// Proxies `req` if its path falls under a configured route. The
    /// request is handed back untouched otherwise.
    pub async fn handle(
        &self,
        req: Request<Bytes>,
    ) -> std::result::Result<Response<ResponseBody>, Request<Bytes>> {
        let table = self.proxies.load_full();
        match table.match_path(req.uri().path()) {
            Some(target) => Ok(self.forward(&target, req).await),
            None => Err(req),
        }
    }

    /// Sends `req` to the upstream named by `target`.
    ///
    /// Unsafe methods on a caching route get a 405 without any upstream
    /// call. Upstream failures become a plain-text 500.
    pub async fn forward(
        &self,
        target: &ProxyMatch<'_>,
        req: Request<Bytes>,
    ) -> Response<ResponseBody> {
        let kind = target.kind.as_str();
        let path = target.config.path.as_str();

        if target.kind == ProxyKind::Caching && !CACHING_PROXY_METHODS.contains(req.method()) {
            warn!(
                "Rejected {} {} on caching proxy '{}'",
                req.method(),
                req.uri().path(),
                path
            );
            self.metrics
                .send(MetricName::CachingProxyRejected, &[("proxy", path)]);
            let mut resp = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
            resp.headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD, OPTIONS"));
            return resp;
        }

        let mut url = format!("{}{}", target.config.target_origin(), target.upstream_path);
        if let Some(query) = req.uri().query() {
            url.push('?');
            url.push_str(query);
        }

        let ctx = RewriteContext {
            config: target.config,
            kind: target.kind,
            app_host: &self.app_host,
            app_origin: &self.app_origin,
        };

        self.metrics
            .send(MetricName::ProxyRequest, &[("proxy", path), ("kind", kind)]);
        debug!("Proxying {} {} -> {}", req.method(), req.uri().path(), url);

        let result = match url.parse::<Uri>() {
            Ok(uri) => {
                let (mut parts, body) = req.into_parts();
                parts.uri = uri;
                parts.version = Version::HTTP_11;
                rewrite_request_headers(&mut parts.headers, &ctx);
                self.client.send(Request::from_parts(parts, body)).await
            }
            Err(e) => Err(Error::Upstream {
                url: url.clone(),
                reason: e.to_string(),
            }),
        };

        match result {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                rewrite_response_headers(&mut parts.headers, &ctx);
                if let Ok(value) = HeaderValue::from_str(&url) {
                    parts.headers.insert(X_PROXY_REQUEST_URL, value);
                }
                Response::from_parts(parts, full_body(body))
            }
            Err(e) => {
                let reason = match e {
                    Error::Upstream { reason, .. } => reason,
                    other => other.to_string(),
                };
                error!("Error proxying {}: {}", url, reason);
                self.metrics
                    .send(MetricName::ProxyFailure, &[("proxy", path), ("kind", kind)]);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error proxying {}: {}", url, reason),
                )
            }
        }
    }
}
