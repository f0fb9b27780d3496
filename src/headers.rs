//! Reserved header names shared by the cache, proxy and Lambda layers.
//!
//! All names are lowercase; `hyper::header::HeaderName` lookups are
//! case-insensitive, so these match whatever casing the client used.

use hyper::header::HeaderMap;

/// Set to `"true"` on responses replayed from the page cache.
pub const X_FROM_CACHE: &str = "x-ssr-from-cache";

/// Opaque request classification (e.g. bot vs. human) set by the edge layer.
pub const X_REQUEST_CLASS: &str = "x-ssr-request-class";

/// Canonical querystring supplied by the edge, overriding the URL's own.
pub const X_QUERYSTRING: &str = "x-ssr-querystring";

/// Comma-separated list of header names whose values are percent-encoded.
pub const X_ENCODED_HEADERS: &str = "x-encoded-headers";

/// Correlation id copied from the inbound event to the outbound response.
pub const X_CORRELATION_ID: &str = "x-correlation-id";

/// Holds the real `Content-Type` while a response is marked binary.
pub const X_ORIGINAL_CONTENT_TYPE: &str = "x-ssr-original-content-type";

/// Names the upstream URL a proxied response came from.
pub const X_PROXY_REQUEST_URL: &str = "x-proxy-request-url";

/// Marks requests the application sends to its own host.
pub const X_LOOPBACK: &str = "x-ssr-loopback";

/// Per-request opt-out of page caching, set by the edge or a client.
pub const X_NO_CACHE: &str = "x-ssr-no-cache";

/// Hop-by-hop headers (RFC 7230 §6.1); never forwarded and never cached.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers injected by the hosting platform or edge that must not leak to
/// upstream targets.
pub const PLATFORM_INJECTED: &[&str] = &[
    "x-amzn-trace-id",
    "x-amzn-requestid",
    "x-amz-cf-id",
    "x-amz-cf-pop",
    "x-apigateway-event",
    "x-apigateway-context",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-forwarded-proto",
    "via",
    X_REQUEST_CLASS,
    X_QUERYSTRING,
    X_ENCODED_HEADERS,
    X_NO_CACHE,
];

/// Returns the first value of `name` as a string, if present and valid.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Removes every header named in `names`.
pub fn remove_all(headers: &mut HeaderMap, names: &[&str]) {
    for name in names {
        headers.remove(*name);
    }
}
