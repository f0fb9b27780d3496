pub mod parser;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::proxy::config::{
    proxy_configs_from_env, validate_proxy_configs, Protocol, ProxyConfig,
};

/// Backing store for the page cache.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process Moka cache; lost on restart.
    #[default]
    Memory,
    /// One JSON + body file pair per entry under `CacheConfig::dir`.
    Filesystem,
}

/// Longest page lifetime `ttl` may ask for: ten years.
pub const MAX_CACHE_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Settings of the `cache { ... }` block.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub store: StoreKind,
    pub dir: String,
    pub namespace: String,
    /// Lifetime of stored pages in seconds. `None` keeps them until evicted.
    pub ttl_secs: Option<u64>,
    pub max_entries: u64,
    pub ignore_device_type: bool,
    pub ignore_request_class: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: StoreKind::Memory,
            dir: ".ssr-cache".to_string(),
            namespace: "pages".to_string(),
            ttl_secs: Some(600),
            max_entries: 10_000,
            ignore_device_type: false,
            ignore_request_class: false,
        }
    }
}

/// The global application configuration state.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub listen: String,
    pub workers: usize,
    /// Public authority of the application, `host` or `host:port`. Mandatory.
    pub app_hostname: String,
    pub app_protocol: Protocol,
    /// When false, inbound `Cookie` is stripped and `Set-Cookie` discarded
    /// on non-proxied routes.
    pub allow_cookies: bool,
    /// Directory served by the static site renderer.
    pub static_root: String,
    pub gzip: bool,
    pub upstream_timeout_secs: u64,
    /// Path to the TLS certificate file (e.g., cert.pem)
    pub tls_cert_path: Option<String>,
    /// Path to the TLS private key file (e.g., key.pem)
    pub tls_key_path: Option<String>,
    /// Path to write structured access logs. If None, access logging is disabled.
    pub access_log_path: Option<String>,
    /// Format of access log entries: "json" (default), "combined", or "common".
    pub access_log_format: Option<String>,
    pub cache: CacheConfig,
    pub proxies: Vec<ProxyConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            workers: 4,
            app_hostname: "localhost:3000".to_string(),
            app_protocol: Protocol::Http,
            allow_cookies: false,
            static_root: "build".to_string(),
            gzip: true,
            upstream_timeout_secs: 30,
            tls_cert_path: None,
            tls_key_path: None,
            access_log_path: None,
            access_log_format: None,
            cache: CacheConfig::default(),
            proxies: Vec::new(),
        }
    }
}

impl AppConfig {
    /// `<protocol>://<app_hostname>`.
    pub fn app_origin(&self) -> String {
        format!("{}://{}", self.app_protocol, self.app_hostname)
    }

    /// Checks every startup invariant. Any failure is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.app_hostname.trim().is_empty() {
            return Err(Error::Config(
                "app_hostname (EXTERNAL_DOMAIN_NAME) is required".to_string(),
            ));
        }
        self.listen.parse::<SocketAddr>().map_err(|e| {
            Error::Config(format!("Invalid listen address '{}': {}", self.listen, e))
        })?;
        if self.workers == 0 {
            return Err(Error::Config("worker_threads must be at least 1".to_string()));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(Error::Config(
                "ssl_certificate and ssl_certificate_key must be set together".to_string(),
            ));
        }
        if self.cache.namespace.trim().is_empty() {
            return Err(Error::Config("cache namespace must not be empty".to_string()));
        }
        if let Some(ttl) = self.cache.ttl_secs.filter(|&ttl| ttl > MAX_CACHE_TTL_SECS) {
            return Err(Error::Config(format!(
                "cache ttl {} exceeds the maximum of {} seconds",
                ttl, MAX_CACHE_TTL_SECS
            )));
        }
        validate_proxy_configs(&self.proxies)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(Error::Config(format!(
            "'{}' expects on/off, got '{}'",
            key, value
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::Config(format!("'{}' expects a number, got '{}'", key, value)))
}

fn bind_address(listen: &str) -> String {
    if listen.contains(':') {
        listen.to_string()
    } else {
        format!("0.0.0.0:{}", listen)
    }
}

fn apply_cache_directives(cache: &mut CacheConfig, directives: &HashMap<String, String>) -> Result<()> {
    for (key, value) in directives {
        match key.as_str() {
            "enabled" => cache.enabled = parse_bool(key, value)?,
            "store" => {
                cache.store = match value.as_str() {
                    "memory" => StoreKind::Memory,
                    "filesystem" => StoreKind::Filesystem,
                    other => {
                        return Err(Error::Config(format!("Unknown cache store '{}'", other)))
                    }
                }
            }
            "dir" => cache.dir = value.clone(),
            "namespace" => cache.namespace = value.clone(),
            "ttl" => {
                let ttl: u64 = parse_num(key, value)?;
                cache.ttl_secs = (ttl > 0).then_some(ttl);
            }
            "max_entries" => cache.max_entries = parse_num(key, value)?,
            "ignore_device_type" => cache.ignore_device_type = parse_bool(key, value)?,
            "ignore_request_class" => cache.ignore_request_class = parse_bool(key, value)?,
            other => return Err(Error::Config(format!("Unknown cache directive '{}'", other))),
        }
    }
    Ok(())
}

/// Builds an [`AppConfig`] from `ssr.conf` text. Not yet validated.
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let file = parser::parse_ssr_config(content).map_err(Error::Config)?;
    let mut cfg = AppConfig::default();

    for (key, value) in &file.directives {
        match key.as_str() {
            "listen" => cfg.listen = bind_address(value),
            "worker_threads" => cfg.workers = parse_num(key, value)?,
            "app_hostname" => cfg.app_hostname = value.clone(),
            "app_protocol" => cfg.app_protocol = value.parse()?,
            "allow_cookies" => cfg.allow_cookies = parse_bool(key, value)?,
            "static_root" => cfg.static_root = value.clone(),
            "gzip" => cfg.gzip = parse_bool(key, value)?,
            "upstream_timeout" => cfg.upstream_timeout_secs = parse_num(key, value)?,
            "ssl_certificate" => cfg.tls_cert_path = Some(value.clone()),
            "ssl_certificate_key" => cfg.tls_key_path = Some(value.clone()),
            "access_log" => cfg.access_log_path = Some(value.clone()),
            "access_log_format" => cfg.access_log_format = Some(value.clone()),
            other => return Err(Error::Config(format!("Unknown directive '{}'", other))),
        }
    }

    if let Some(cache) = &file.cache {
        apply_cache_directives(&mut cfg.cache, &cache.directives)?;
    }

    for proxy in file.proxies {
        let host = proxy
            .host
            .ok_or_else(|| Error::Config(format!("Proxy '{}' has no host", proxy.name)))?;
        let protocol = proxy.protocol.unwrap_or_else(|| "https".to_string());
        let path = proxy.path.unwrap_or_else(|| proxy.name.clone());
        cfg.proxies.push(ProxyConfig::new(&protocol, &host, &path)?);
    }

    Ok(cfg)
}

/// Overlays environment variables read through `lookup`.
pub fn apply_env<F>(cfg: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(listen) = lookup("SSR_LISTEN") {
        cfg.listen = bind_address(&listen);
    }
    if let Some(host) = lookup("EXTERNAL_DOMAIN_NAME") {
        cfg.app_hostname = host;
    }
    if let Some(protocol) = lookup("SSR_APP_PROTOCOL") {
        cfg.app_protocol = protocol.parse()?;
    }
    if let Some(allow) = lookup("SSR_ALLOW_COOKIES") {
        cfg.allow_cookies = parse_bool("SSR_ALLOW_COOKIES", &allow)?;
    }
    if let Some(dir) = lookup("SSR_CACHE_DIR") {
        cfg.cache.dir = dir;
        cfg.cache.store = StoreKind::Filesystem;
    }
    cfg.proxies.extend(proxy_configs_from_env(&lookup)?);
    Ok(())
}

/// Loads `conf_path` (defaults when the file is missing), overlays `lookup`,
/// and validates the result.
pub fn load_config_with<F>(conf_path: &str, lookup: F) -> Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = match std::fs::read_to_string(conf_path) {
        Ok(content) => {
            let cfg = parse_config(&content).map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("in '{}': {}", conf_path, msg)),
                other => other,
            })?;
            tracing::info!("Loaded config from {}", conf_path);
            cfg
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Could not find {}, using default config", conf_path);
            AppConfig::default()
        }
        Err(e) => return Err(Error::Config(format!("cannot read '{}': {}", conf_path, e))),
    };
    apply_env(&mut cfg, lookup)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Loads the configuration using the process environment.
pub fn load_config(conf_path: &str) -> Result<AppConfig> {
    load_config_with(conf_path, |key| std::env::var(key).ok())
}
