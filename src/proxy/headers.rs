//! Header rewriting in both directions of a proxied exchange.

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, COOKIE, HOST, LOCATION, ORIGIN, SET_COOKIE,
};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use super::config::{ProxyConfig, ProxyKind};
use crate::headers::{remove_all, HOP_BY_HOP, PLATFORM_INJECTED};

/// Where a proxied exchange goes and which public origin it answers for.
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    pub config: &'a ProxyConfig,
    pub kind: ProxyKind,
    /// The application's own authority, `host` or `host:port`.
    pub app_host: &'a str,
    /// The application's public origin, e.g. `https://shop.example.com`.
    pub app_origin: &'a str,
}

impl RewriteContext<'_> {
    fn route_prefix(&self) -> &str {
        match self.kind {
            ProxyKind::Standard => &self.config.proxy_path,
            ProxyKind::Caching => &self.config.caching_path,
        }
    }

    fn app_hostname(&self) -> &str {
        self.app_host.split(':').next().unwrap_or(self.app_host)
    }
}

/// Removes headers named by `Connection` plus the fixed hop-by-hop set.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in nominated {
        headers.remove(name);
    }
    remove_all(headers, HOP_BY_HOP);
}

/// Prepares inbound request headers for the upstream.
pub fn rewrite_request_headers(headers: &mut HeaderMap, ctx: &RewriteContext<'_>) {
    strip_hop_by_hop(headers);
    remove_all(headers, PLATFORM_INJECTED);

    if let Ok(host) = HeaderValue::from_str(&ctx.config.host) {
        headers.insert(HOST, host);
    }
    if headers.contains_key(ORIGIN) {
        if let Ok(origin) = HeaderValue::from_str(&ctx.config.target_origin()) {
            headers.insert(ORIGIN, origin);
        }
    }
    if ctx.kind == ProxyKind::Caching {
        headers.remove(COOKIE);
    }
}

/// Prepares upstream response headers for the client.
pub fn rewrite_response_headers(headers: &mut HeaderMap, ctx: &RewriteContext<'_>) {
    strip_hop_by_hop(headers);

    if ctx.kind == ProxyKind::Caching {
        if headers.remove(SET_COOKIE).is_some() {
            debug!("Dropped Set-Cookie from caching proxy {}", ctx.config.path);
        }
    } else {
        let cookies: Vec<HeaderValue> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| match v.to_str() {
                Ok(cookie) => {
                    let rewritten = rewrite_cookie_domain(
                        cookie,
                        ctx.config.target_hostname(),
                        ctx.app_hostname(),
                    );
                    HeaderValue::from_str(&rewritten).unwrap_or_else(|_| v.clone())
                }
                Err(_) => v.clone(),
            })
            .collect();
        if !cookies.is_empty() {
            headers.remove(SET_COOKIE);
            for cookie in cookies {
                headers.append(SET_COOKIE, cookie);
            }
        }
    }

    let location = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|loc| rewrite_location(loc, ctx));
    if let Some(location) = location.and_then(|l| HeaderValue::from_str(&l).ok()) {
        headers.insert(LOCATION, location);
    }
}

/// Replaces a `Domain` attribute naming the upstream host with the
/// application's host. Other domains pass through untouched.
pub fn rewrite_cookie_domain(cookie: &str, upstream_host: &str, app_host: &str) -> String {
    static DOMAIN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = DOMAIN
        .get_or_init(|| Regex::new(r"(?i)(;\s*domain=)([^;]*)").ok())
        .as_ref()
    else {
        return cookie.to_string();
    };

    re.replace_all(cookie, |caps: &regex::Captures<'_>| {
        let domain = caps[2].trim();
        if domain.trim_start_matches('.').eq_ignore_ascii_case(upstream_host) {
            format!("{}{}", &caps[1], app_host)
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

/// Maps an absolute redirect to the upstream host back onto the
/// application's origin under the proxy route. Returns `None` when the
/// location needs no change.
pub fn rewrite_location(location: &str, ctx: &RewriteContext<'_>) -> Option<String> {
    let url = url::Url::parse(location).ok()?;
    let authority = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return None,
    };
    if !authority.eq_ignore_ascii_case(&ctx.config.host) {
        return None;
    }

    let mut rewritten = format!("{}{}{}", ctx.app_origin, ctx.route_prefix(), url.path());
    if let Some(query) = url.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        rewritten.push('#');
        rewritten.push_str(fragment);
    }
    Some(rewritten)
}
