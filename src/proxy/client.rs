//! Outbound HTTP clients.
//!
//! [`UpstreamClient`] is the seam every proxied and loopback request goes
//! through. [`HyperUpstreamClient`] is the real client; [`LoopbackClient`]
//! decorates any client with headers that only the application's own host
//! should receive. The process-wide instance is built once by
//! [`init_shared_client`].

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Sends a request upstream and returns the buffered response.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// HTTP/1 client over rustls with webpki roots.
pub struct HyperUpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HyperUpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|e| Error::Config(format!("TLS client setup failed: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl UpstreamClient for HyperUpstreamClient {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let url = req.uri().to_string();
        let upstream_err = |reason: String| Error::Upstream {
            url: url.clone(),
            reason,
        };

        let fut = self.client.request(req.map(Full::new));
        let resp = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(upstream_err(e.to_string())),
            Err(_) => {
                return Err(upstream_err(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| upstream_err(e.to_string()))?
            .to_bytes();
        debug!("Upstream {} answered {} ({} bytes)", url, parts.status, body.len());
        Ok(Response::from_parts(parts, body))
    }
}

/// Adds fixed headers to requests aimed at the application itself.
pub struct LoopbackClient {
    inner: Arc<dyn UpstreamClient>,
    app_host: String,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl LoopbackClient {
    pub fn new(inner: Arc<dyn UpstreamClient>, app_host: impl Into<String>) -> Self {
        Self {
            inner,
            app_host: app_host.into().to_ascii_lowercase(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    fn is_loopback(&self, req: &Request<Bytes>) -> bool {
        let Some(authority) = req.uri().authority() else {
            return false;
        };
        let app_hostname = self.app_host.split(':').next().unwrap_or(&self.app_host);
        authority.as_str().eq_ignore_ascii_case(&self.app_host)
            || (authority.port().is_none() && authority.host().eq_ignore_ascii_case(app_hostname))
    }
}

#[async_trait]
impl UpstreamClient for LoopbackClient {
    async fn send(&self, mut req: Request<Bytes>) -> Result<Response<Bytes>> {
        if self.is_loopback(&req) {
            for (name, value) in &self.headers {
                req.headers_mut().insert(name.clone(), value.clone());
            }
        }
        self.inner.send(req).await
    }
}

static SHARED_CLIENT: OnceLock<Arc<dyn UpstreamClient>> = OnceLock::new();

/// Installs the process-wide client. Only the first call has any effect;
/// the installed client lives for the rest of the process.
pub fn init_shared_client<F>(build: F) -> Result<Arc<dyn UpstreamClient>>
where
    F: FnOnce() -> Result<Arc<dyn UpstreamClient>>,
{
    if let Some(client) = SHARED_CLIENT.get() {
        return Ok(Arc::clone(client));
    }
    let client = build()?;
    if SHARED_CLIENT.set(Arc::clone(&client)).is_ok() {
        info!("Outbound HTTP client initialized");
        Ok(client)
    } else {
        shared_client().ok_or_else(|| Error::Config("shared client vanished".to_string()))
    }
}

/// The process-wide client, if initialized.
pub fn shared_client() -> Option<Arc<dyn UpstreamClient>> {
    SHARED_CLIENT.get().cloned()
}
