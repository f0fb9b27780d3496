//! Integration tests for the SSR runtime.
//!
//! These drive whole requests through `SsrRuntime`, the Lambda handler and
//! the dev server, using in-process renderers, counting upstream mocks and
//! a wiremock upstream.

#[cfg(test)]
mod support {
    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use hyper::header::HeaderMap;
    use hyper::{Request, Response, StatusCode};
    use parking_lot::Mutex;
    use ssr_runtime::cache::{CacheRecord, CacheStore, CacheWrite, MemoryStore};
    use ssr_runtime::proxy::client::UpstreamClient;
    use ssr_runtime::render::Renderer;
    use ssr_runtime::response::{ResponseBody, ResponseWriter};
    use ssr_runtime::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Renders `<html>{last path segment}</html>`; `/missing` is a 404.
    #[derive(Default)]
    pub struct ProductRenderer {
        pub renders: AtomicUsize,
    }

    impl ProductRenderer {
        pub fn count(&self) -> usize {
            self.renders.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Renderer for ProductRenderer {
        async fn render(&self, req: &Request<Bytes>, res: &mut ResponseWriter) -> Result<()> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            let path = req.uri().path();
            if path == "/missing" {
                res.set_status(StatusCode::NOT_FOUND)?;
                return res.end_with("not here");
            }
            let id = path.rsplit('/').next().unwrap_or("");
            res.set_header("content-type", "text/html; charset=utf-8")?;
            res.write("<html>")?;
            res.write(Bytes::from(id.to_string()))?;
            res.end_with("</html>")
        }
    }

    pub struct FailingRenderer;

    #[async_trait]
    impl Renderer for FailingRenderer {
        async fn render(&self, _req: &Request<Bytes>, _res: &mut ResponseWriter) -> Result<()> {
            Err(Error::Render("template exploded".to_string()))
        }
    }

    /// A memory store that remembers every write it was asked to make.
    pub struct RecordingStore {
        inner: MemoryStore,
        pub puts: Mutex<Vec<CacheWrite>>,
    }

    impl Default for RecordingStore {
        fn default() -> Self {
            Self {
                inner: MemoryStore::new(1_000, 600),
                puts: Mutex::new(Vec::new()),
            }
        }
    }

    impl RecordingStore {
        pub fn put_count(&self) -> usize {
            self.puts.lock().len()
        }
    }

    #[async_trait]
    impl CacheStore for RecordingStore {
        async fn get(&self, key: &str, namespace: &str) -> Result<CacheRecord> {
            self.inner.get(key, namespace).await
        }

        async fn put(&self, entry: CacheWrite) -> Result<()> {
            self.puts.lock().push(entry.clone());
            self.inner.put(entry).await
        }

        async fn delete(&self, key: &str, namespace: &str) -> Result<bool> {
            self.inner.delete(key, namespace).await
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// Counts upstream calls and answers every one with `200 upstream`.
    #[derive(Default)]
    pub struct CountingUpstream {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamClient for CountingUpstream {
        async fn send(&self, _req: Request<Bytes>) -> Result<Response<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(Bytes::from_static(b"upstream")))
        }
    }

    pub async fn read(resp: Response<ResponseBody>) -> (StatusCode, HeaderMap, String) {
        let (parts, body) = resp.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        (
            parts.status,
            parts.headers,
            String::from_utf8_lossy(&bytes).into_owned(),
        )
    }

    pub fn get(uri: &str) -> Request<Bytes> {
        Request::get(uri).body(Bytes::new()).unwrap()
    }
}

#[cfg(test)]
mod page_cache_tests {
    use super::support::*;
    use ssr_runtime::config::AppConfig;
    use ssr_runtime::headers::X_FROM_CACHE;
    use ssr_runtime::SsrRuntime;
    use std::sync::Arc;

    async fn runtime(
        store: Arc<RecordingStore>,
        renderer: Arc<ProductRenderer>,
    ) -> Arc<SsrRuntime> {
        SsrRuntime::builder(AppConfig::default())
            .store(store)
            .renderer(renderer)
            .upstream_client(Arc::new(CountingUpstream::default()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_store_then_hit() {
        let store = Arc::new(RecordingStore::default());
        let renderer = Arc::new(ProductRenderer::default());
        let runtime = runtime(store.clone(), renderer.clone()).await;

        let (status, headers, body) = read(runtime.handle(get("/product/123")).await).await;
        assert_eq!(status, 200);
        assert_eq!(body, "<html>123</html>");
        assert!(!headers.contains_key(X_FROM_CACHE));

        runtime.monitor().wait_for_responses().await;
        {
            let puts = store.puts.lock();
            assert_eq!(puts.len(), 1);
            assert_eq!(puts[0].data.as_deref(), Some(&b"<html>123</html>"[..]));
            assert_eq!(puts[0].metadata.status, 200);
            assert_eq!(puts[0].expiration_seconds, Some(600));
        }

        let (status, headers, body) = read(runtime.handle(get("/product/123")).await).await;
        assert_eq!(status, 200);
        assert_eq!(body, "<html>123</html>");
        assert_eq!(headers[X_FROM_CACHE], "true");
        assert_eq!(headers["content-type"], "text/html; charset=utf-8");
        assert_eq!(renderer.count(), 1);
    }

    #[tokio::test]
    async fn test_query_order_does_not_split_the_cache() {
        let store = Arc::new(RecordingStore::default());
        let renderer = Arc::new(ProductRenderer::default());
        let runtime = runtime(store, renderer.clone()).await;

        read(runtime.handle(get("/search/q?b=2&a=1")).await).await;
        runtime.monitor().wait_for_responses().await;
        let (_, headers, _) = read(runtime.handle(get("/search/q?a=1&b=2")).await).await;
        assert_eq!(headers[X_FROM_CACHE], "true");

        read(runtime.handle(get("/search/q?a=1&b=3")).await).await;
        assert_eq!(renderer.count(), 2);
    }

    #[tokio::test]
    async fn test_request_class_splits_the_cache() {
        let store = Arc::new(RecordingStore::default());
        let renderer = Arc::new(ProductRenderer::default());
        let runtime = runtime(store, renderer.clone()).await;

        read(runtime.handle(get("/product/1")).await).await;
        runtime.monitor().wait_for_responses().await;

        let bot = hyper::Request::get("/product/1")
            .header("x-ssr-request-class", "bot")
            .body(bytes::Bytes::new())
            .unwrap();
        let (_, headers, _) = read(runtime.handle(bot).await).await;
        assert!(!headers.contains_key(X_FROM_CACHE));
        assert_eq!(renderer.count(), 2);
    }

    #[tokio::test]
    async fn test_errors_and_opt_outs_are_not_stored() {
        let store = Arc::new(RecordingStore::default());
        let renderer = Arc::new(ProductRenderer::default());
        let runtime = runtime(store.clone(), renderer).await;

        let (status, _, _) = read(runtime.handle(get("/missing")).await).await;
        assert_eq!(status, 404);

        let opted_out = hyper::Request::get("/product/9")
            .header("x-ssr-no-cache", "1")
            .body(bytes::Bytes::new())
            .unwrap();
        let (status, _, _) = read(runtime.handle(opted_out).await).await;
        assert_eq!(status, 200);

        let post = hyper::Request::post("/product/9")
            .body(bytes::Bytes::new())
            .unwrap();
        read(runtime.handle(post).await).await;

        runtime.monitor().wait_for_responses().await;
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_render_failure_is_500_and_not_cached() {
        let store = Arc::new(RecordingStore::default());
        let runtime = SsrRuntime::builder(AppConfig::default())
            .store(store.clone())
            .renderer(Arc::new(FailingRenderer))
            .upstream_client(Arc::new(CountingUpstream::default()))
            .build()
            .await
            .unwrap();

        let (status, _, body) = read(runtime.handle(get("/product/1")).await).await;
        assert_eq!(status, 500);
        assert_eq!(body, "Internal Server Error");

        runtime.monitor().wait_for_responses().await;
        assert_eq!(store.put_count(), 0);
        assert_eq!(runtime.monitor().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_renders() {
        let renderer = Arc::new(ProductRenderer::default());
        let mut cfg = AppConfig::default();
        cfg.cache.enabled = false;
        let runtime = SsrRuntime::builder(cfg)
            .renderer(renderer.clone())
            .upstream_client(Arc::new(CountingUpstream::default()))
            .build()
            .await
            .unwrap();

        read(runtime.handle(get("/product/1")).await).await;
        read(runtime.handle(get("/product/1")).await).await;
        assert!(runtime.cache().is_none());
        assert_eq!(renderer.count(), 2);
    }

    #[tokio::test]
    async fn test_builtin_routes() {
        let runtime = runtime(
            Arc::new(RecordingStore::default()),
            Arc::new(ProductRenderer::default()),
        )
        .await;
        read(runtime.handle(get("/product/1")).await).await;

        let (status, _, body) = read(runtime.handle(get("/__ssr/healthz")).await).await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok");

        let (_, _, body) = read(runtime.handle(get("/__ssr/metrics")).await).await;
        assert!(body.contains("ssr_requests_total"));
        assert!(body.contains("name=\"CacheMiss\""));
    }
}

#[cfg(test)]
mod cookie_tests {
    use super::support::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use hyper::Request;
    use ssr_runtime::config::AppConfig;
    use ssr_runtime::render::Renderer;
    use ssr_runtime::response::ResponseWriter;
    use ssr_runtime::{Result, SsrRuntime};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CookieRenderer {
        saw_cookie: AtomicBool,
    }

    #[async_trait]
    impl Renderer for CookieRenderer {
        async fn render(&self, req: &Request<Bytes>, res: &mut ResponseWriter) -> Result<()> {
            self.saw_cookie
                .store(req.headers().contains_key("cookie"), Ordering::SeqCst);
            res.set_header("set-cookie", "session=abc; Path=/")?;
            res.end_with("hello")
        }
    }

    async fn run(allow_cookies: bool) -> (bool, bool) {
        let renderer = Arc::new(CookieRenderer::default());
        let cfg = AppConfig {
            allow_cookies,
            ..AppConfig::default()
        };
        let runtime = SsrRuntime::builder(cfg)
            .store(Arc::new(RecordingStore::default()))
            .renderer(renderer.clone())
            .upstream_client(Arc::new(CountingUpstream::default()))
            .build()
            .await
            .unwrap();

        let req = Request::get("/account")
            .header("cookie", "session=old")
            .body(Bytes::new())
            .unwrap();
        let (_, headers, body) = read(runtime.handle(req).await).await;
        assert_eq!(body, "hello");
        (
            renderer.saw_cookie.load(Ordering::SeqCst),
            headers.contains_key("set-cookie"),
        )
    }

    #[tokio::test]
    async fn test_cookies_stripped_when_disallowed() {
        let (saw_cookie, sent_cookie) = run(false).await;
        assert!(!saw_cookie);
        assert!(!sent_cookie);
    }

    #[tokio::test]
    async fn test_cookies_pass_when_allowed() {
        let (saw_cookie, sent_cookie) = run(true).await;
        assert!(saw_cookie);
        assert!(sent_cookie);
    }
}

#[cfg(test)]
mod proxy_route_tests {
    use super::support::*;
    use bytes::Bytes;
    use hyper::{Method, Request};
    use ssr_runtime::config::AppConfig;
    use ssr_runtime::proxy::client::HyperUpstreamClient;
    use ssr_runtime::proxy::config::ProxyConfig;
    use ssr_runtime::SsrRuntime;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_caching_proxy_method_gating() {
        let upstream = Arc::new(CountingUpstream::default());
        let cfg = AppConfig {
            proxies: vec![ProxyConfig::parse("https://api.example.com/api").unwrap()],
            ..AppConfig::default()
        };
        let runtime = SsrRuntime::builder(cfg)
            .store(Arc::new(RecordingStore::default()))
            .renderer(Arc::new(ProductRenderer::default()))
            .upstream_client(upstream.clone())
            .build()
            .await
            .unwrap();

        for m in [Method::POST, Method::PUT, Method::DELETE] {
            let req = Request::builder()
                .method(m)
                .uri("/__caching/api/basket")
                .body(Bytes::new())
                .unwrap();
            let (status, headers, _) = read(runtime.handle(req).await).await;
            assert_eq!(status, 405);
            assert_eq!(headers["allow"], "GET, HEAD, OPTIONS");
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

        for m in [Method::GET, Method::HEAD, Method::OPTIONS] {
            let req = Request::builder()
                .method(m)
                .uri("/__caching/api/basket")
                .body(Bytes::new())
                .unwrap();
            let (status, _, _) = read(runtime.handle(req).await).await;
            assert_eq!(status, 200);
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_proxy_to_real_upstream() {
        let server = MockServer::start().await;
        let host = server.address().to_string();
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header("host", host.as_str()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("[1,2]")
                    .insert_header("set-cookie", "sid=9; Domain=127.0.0.1; Path=/"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cfg = AppConfig {
            proxies: vec![ProxyConfig::parse(&format!("http://{}/api", host)).unwrap()],
            allow_cookies: false,
            ..AppConfig::default()
        };
        let runtime = SsrRuntime::builder(cfg)
            .store(Arc::new(RecordingStore::default()))
            .renderer(Arc::new(ProductRenderer::default()))
            .upstream_client(Arc::new(
                HyperUpstreamClient::new(Duration::from_secs(5)).unwrap(),
            ))
            .build()
            .await
            .unwrap();

        let req = Request::get("/__proxy/api/items")
            .header("cookie", "sid=1")
            .body(Bytes::new())
            .unwrap();
        let (status, headers, body) = read(runtime.handle(req).await).await;
        assert_eq!(status, 200);
        assert_eq!(body, "[1,2]");
        assert_eq!(
            headers["x-proxy-request-url"],
            format!("http://{}/items", host).as_str()
        );
        assert_eq!(headers["set-cookie"], "sid=9; Domain=localhost; Path=/");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_500() {
        let cfg = AppConfig {
            proxies: vec![ProxyConfig::parse("http://127.0.0.1:9/down").unwrap()],
            ..AppConfig::default()
        };
        let runtime = SsrRuntime::builder(cfg)
            .store(Arc::new(RecordingStore::default()))
            .renderer(Arc::new(ProductRenderer::default()))
            .upstream_client(Arc::new(
                HyperUpstreamClient::new(Duration::from_secs(2)).unwrap(),
            ))
            .build()
            .await
            .unwrap();

        let (status, headers, body) = read(runtime.handle(get("/__proxy/down/x")).await).await;
        assert_eq!(status, 500);
        assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
        assert!(body.starts_with("Error proxying http://127.0.0.1:9/x:"));
    }
}

#[cfg(test)]
mod lambda_tests {
    use super::support::*;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use hyper::header::{HeaderName, HeaderValue};
    use hyper::Request;
    use ssr_runtime::config::AppConfig;
    use ssr_runtime::lambda::{ApiGatewayProxyEvent, LambdaContext, LambdaHandler};
    use ssr_runtime::render::Renderer;
    use ssr_runtime::response::ResponseWriter;
    use ssr_runtime::{Result, SsrRuntime};
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    struct EncodedRenderer;

    #[async_trait]
    impl Renderer for EncodedRenderer {
        async fn render(&self, _req: &Request<Bytes>, res: &mut ResponseWriter) -> Result<()> {
            res.set_header("content-type", "text/html")?;
            res.set_header("content-encoding", "gzip")?;
            res.insert_header(
                HeaderName::from_static("x-title"),
                HeaderValue::from_bytes("café".as_bytes()).unwrap(),
            )?;
            res.end_with(Bytes::from(gzip("<html>zipped</html>")))
        }
    }

    fn event(path: &str) -> ApiGatewayProxyEvent {
        ApiGatewayProxyEvent {
            http_method: "GET".to_string(),
            path: path.to_string(),
            headers: Some(HashMap::from([(
                "X-Correlation-Id".to_string(),
                "corr-42".to_string(),
            )])),
            ..Default::default()
        }
    }

    async fn handler(renderer: Arc<dyn Renderer>, store: Arc<RecordingStore>) -> LambdaHandler {
        let runtime = SsrRuntime::builder(AppConfig::default())
            .store(store)
            .renderer(renderer)
            .upstream_client(Arc::new(CountingUpstream::default()))
            .build()
            .await
            .unwrap();
        LambdaHandler::new(runtime)
    }

    #[tokio::test]
    async fn test_invocation_waits_for_cache_write_and_metrics() {
        let store = Arc::new(RecordingStore::default());
        let handler = handler(Arc::new(ProductRenderer::default()), store.clone()).await;
        let mut ctx = LambdaContext {
            callback_waits_for_empty_event_loop: true,
            ..Default::default()
        };

        assert!(!handler.is_reused());
        let resp = handler.handle(event("/product/7"), &mut ctx).await.unwrap();
        assert!(!ctx.callback_waits_for_empty_event_loop);
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, "<html>7</html>");
        assert!(!resp.is_base64_encoded);
        assert_eq!(resp.headers["x-correlation-id"], "corr-42");

        // Completed before the handler returned.
        assert_eq!(store.put_count(), 1);
        assert_eq!(handler.runtime().monitor().pending_count(), 0);
        assert_eq!(handler.runtime().metrics().queued(), 0);
        assert!(handler.is_reused());

        let resp = handler.handle(event("/product/7"), &mut ctx).await.unwrap();
        assert_eq!(resp.headers["x-ssr-from-cache"], "true");

        let metrics = handler.runtime().metrics().encode();
        assert!(metrics.contains("name=\"ContainerCreated\"} 1"));
        assert!(metrics.contains("name=\"ContainerReused\"} 1"));
    }

    #[tokio::test]
    async fn test_encoded_body_travels_as_base64() {
        let handler = handler(Arc::new(EncodedRenderer), Arc::new(RecordingStore::default())).await;
        let mut ctx = LambdaContext::default();

        let resp = handler.handle(event("/zipped"), &mut ctx).await.unwrap();
        assert!(resp.is_base64_encoded);
        assert_eq!(
            STANDARD.decode(&resp.body).unwrap(),
            gzip("<html>zipped</html>")
        );
        assert_eq!(resp.headers["content-type"], "text/html");
        assert_eq!(resp.headers["content-encoding"], "gzip");
        assert!(!resp.headers.contains_key("x-ssr-original-content-type"));
        assert_eq!(resp.headers["x-title"], "caf%C3%A9");
        assert_eq!(resp.headers["x-encoded-headers"], "x-title");
    }

    #[tokio::test]
    async fn test_paths_with_spaces_and_non_ascii_render() {
        let handler = handler(
            Arc::new(ProductRenderer::default()),
            Arc::new(RecordingStore::default()),
        )
        .await;
        let mut ctx = LambdaContext::default();

        let resp = handler.handle(event("/search/red shoes"), &mut ctx).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, "<html>red%20shoes</html>");

        let resp = handler.handle(event("/product/café"), &mut ctx).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, "<html>caf%C3%A9</html>");
    }

    #[tokio::test]
    async fn test_json_envelopes() {
        let handler = handler(
            Arc::new(ProductRenderer::default()),
            Arc::new(RecordingStore::default()),
        )
        .await;
        let mut ctx = LambdaContext::default();

        let out = handler
            .handle_json(
                r#"{"httpMethod":"GET","path":"/product/55","headers":{}}"#,
                &mut ctx,
            )
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["body"], "<html>55</html>");
        assert_eq!(json["isBase64Encoded"], false);

        assert!(handler.handle_json("not json", &mut ctx).await.is_err());
    }
}

#[cfg(test)]
mod filesystem_store_tests {
    use super::support::*;
    use ssr_runtime::config::{AppConfig, StoreKind};
    use ssr_runtime::SsrRuntime;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_entries_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.cache.store = StoreKind::Filesystem;
        cfg.cache.dir = dir.path().to_string_lossy().into_owned();

        let first = Arc::new(ProductRenderer::default());
        let runtime = SsrRuntime::builder(cfg.clone())
            .renderer(first.clone())
            .upstream_client(Arc::new(CountingUpstream::default()))
            .build()
            .await
            .unwrap();
        read(runtime.handle(get("/product/5")).await).await;
        runtime.monitor().wait_for_responses().await;
        drop(runtime);

        let second = Arc::new(ProductRenderer::default());
        let runtime = SsrRuntime::builder(cfg)
            .renderer(second.clone())
            .upstream_client(Arc::new(CountingUpstream::default()))
            .build()
            .await
            .unwrap();
        let (status, headers, body) = read(runtime.handle(get("/product/5")).await).await;
        assert_eq!(status, 200);
        assert_eq!(body, "<html>5</html>");
        assert_eq!(headers["x-ssr-from-cache"], "true");
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 0);
    }
}

#[cfg(test)]
mod config_tests {
    use ssr_runtime::config::{load_config_with, AppConfig, StoreKind};
    use ssr_runtime::{Error, SsrRuntime};
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_file_uses_defaults_and_env() {
        let cfg = load_config_with(
            "/nonexistent/ssr.conf",
            env(&[
                ("EXTERNAL_DOMAIN_NAME", "shop.example.com"),
                ("SSR_PROXY1", "https://api.example.com/api"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.app_hostname, "shop.example.com");
        assert_eq!(cfg.proxies.len(), 1);
        assert_eq!(cfg.proxies[0].caching_path, "/__caching/api");
    }

    #[test]
    fn test_fatal_configuration_errors() {
        let cases: &[&[(&str, &str)]] = &[
            &[
                ("SSR_PROXY1", "https://a.example.com/api"),
                ("SSR_PROXY2", "https://b.example.com/api"),
            ],
            &[("SSR_PROXY1", "ftp://a.example.com/api")],
            &[("SSR_PROXY1", "https:///api")],
            &[("EXTERNAL_DOMAIN_NAME", "")],
        ];
        for vars in cases {
            let result = load_config_with("/nonexistent/ssr.conf", env(vars));
            assert!(
                matches!(result, Err(Error::Config(_))),
                "expected config error for {:?}",
                vars
            );
        }
    }

    #[test]
    fn test_too_many_proxies_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssr.conf");
        let blocks: String = (0..9)
            .map(|i| format!("proxy p{} {{ host h{}.example.com; }}\n", i, i))
            .collect();
        std::fs::write(&path, blocks).unwrap();

        let result = load_config_with(path.to_str().unwrap(), env(&[]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let cfg = AppConfig {
            app_hostname: String::new(),
            ..AppConfig::default()
        };
        assert!(matches!(
            SsrRuntime::builder(cfg).build().await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_builder_rejects_huge_ttl() {
        for store in [StoreKind::Memory, StoreKind::Filesystem] {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = AppConfig::default();
            cfg.cache.store = store;
            cfg.cache.dir = dir.path().to_string_lossy().into_owned();
            cfg.cache.ttl_secs = Some(99_999_999_999_999);
            assert!(matches!(
                SsrRuntime::builder(cfg).build().await,
                Err(Error::Config(_))
            ));
        }
    }
}

#[cfg(test)]
mod dev_server_tests {
    use super::support::*;
    use bytes::Bytes;
    use hyper::Request;
    use ssr_runtime::config::AppConfig;
    use ssr_runtime::proxy::client::{HyperUpstreamClient, UpstreamClient};
    use ssr_runtime::{server, SsrRuntime};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_serves_over_http_and_shuts_down() {
        let runtime = SsrRuntime::builder(AppConfig::default())
            .store(Arc::new(RecordingStore::default()))
            .renderer(Arc::new(ProductRenderer::default()))
            .upstream_client(Arc::new(CountingUpstream::default()))
            .build()
            .await
            .unwrap();

        let listener = server::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server::serve(runtime, listener, None, shutdown.clone()));

        let client = HyperUpstreamClient::new(Duration::from_secs(5)).unwrap();
        let req = Request::get(format!("http://{}/product/77", addr))
            .body(Bytes::new())
            .unwrap();
        let resp = client.send(req).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(&resp.body()[..], b"<html>77</html>");

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
