//! Binary marking of encoded responses and transport-safe header values.
//!
//! The Lambda envelope decides between base64 and text bodies purely from
//! `Content-Type`. A compressed `text/html` body is not text, so before that
//! decision the real type is parked in [`X_ORIGINAL_CONTENT_TYPE`] and
//! `Content-Type` becomes `application/octet-stream`; after it, the real type
//! is put back.

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::headers::{X_ENCODED_HEADERS, X_ORIGINAL_CONTENT_TYPE};

/// Content type used to force binary treatment.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Marks a response binary when it declares both a content type and a
/// content encoding. Returns `true` if the headers were changed.
///
/// Idempotent: a response already carrying the marker is left alone.
pub fn normalize_binary(headers: &mut HeaderMap) -> bool {
    if headers.contains_key(X_ORIGINAL_CONTENT_TYPE) {
        return false;
    }
    if !headers.contains_key(CONTENT_ENCODING) {
        return false;
    }
    let Some(original) = headers.get(CONTENT_TYPE).cloned() else {
        return false;
    };

    headers.insert(
        HeaderName::from_static(X_ORIGINAL_CONTENT_TYPE),
        original,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    true
}

/// Undoes [`normalize_binary`]. Returns `true` if the marker was present.
pub fn restore_content_type(headers: &mut HeaderMap) -> bool {
    match headers.remove(X_ORIGINAL_CONTENT_TYPE) {
        Some(original) => {
            headers.insert(CONTENT_TYPE, original);
            true
        }
        None => false,
    }
}

/// Whether the platform should carry a body with this content type as
/// base64. Textual types (and a missing type) travel as text.
pub fn is_binary_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else {
        return false;
    };
    let ct = ct
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let textual = ct.starts_with("text/")
        || ct == "application/json"
        || ct.ends_with("+json")
        || ct == "application/javascript"
        || ct == "application/xml"
        || ct.ends_with("+xml")
        || ct == "application/x-www-form-urlencoded";
    !textual
}

/// Percent-encodes everything outside the URI unreserved set and `!*'()`.
pub fn percent_encode(input: &[u8]) -> String {
    const UNRESERVED: &[u8] = b"-_.!~*'()";
    let mut out = String::with_capacity(input.len());
    for &b in input {
        if b.is_ascii_alphanumeric() || UNRESERVED.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Percent-encodes a decoded URL path so it parses as a request target.
///
/// Path characters (`pchar` and `/`) are kept; so are existing `%XX`
/// escapes, which makes the function idempotent on already encoded paths.
pub fn percent_encode_path(path: &str) -> String {
    const PATH_SAFE: &[u8] = b"-._~!$&'()*+,;=:@/";
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for (i, &b) in bytes.iter().enumerate() {
        let escape = b == b'%'
            && bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
            && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
        if b.is_ascii_alphanumeric() || PATH_SAFE.contains(&b) || escape {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Decodes `%XX` sequences. Malformed escapes are kept literally.
pub fn percent_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' && i + 2 < input.len() {
            let hex = std::str::from_utf8(&input[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

fn is_transport_safe(value: &HeaderValue) -> bool {
    value
        .as_bytes()
        .iter()
        .all(|&b| b == b'\t' || (0x20..0x7f).contains(&b))
}

/// Percent-encodes every header value that is not plain visible ASCII and
/// lists the affected names in [`X_ENCODED_HEADERS`].
///
/// Returns the encoded header names.
pub fn encode_unsafe_headers(headers: &mut HeaderMap) -> Vec<String> {
    let unsafe_names: Vec<HeaderName> = headers
        .iter()
        .filter(|(_, v)| !is_transport_safe(v))
        .map(|(k, _)| k.clone())
        .collect();

    let mut encoded = Vec::new();
    for name in unsafe_names {
        if encoded.iter().any(|n: &String| n == name.as_str()) {
            continue;
        }
        let values: Vec<HeaderValue> = headers
            .get_all(&name)
            .iter()
            .filter_map(|v| HeaderValue::from_str(&percent_encode(v.as_bytes())).ok())
            .collect();
        headers.remove(&name);
        for value in values {
            headers.append(name.clone(), value);
        }
        encoded.push(name.as_str().to_string());
    }

    if !encoded.is_empty() {
        debug!("Percent-encoded response headers: {:?}", encoded);
        if let Ok(list) = HeaderValue::from_str(&encoded.join(",")) {
            headers.insert(HeaderName::from_static(X_ENCODED_HEADERS), list);
        }
    }
    encoded
}

/// Decodes the request headers listed in [`X_ENCODED_HEADERS`] and removes
/// the marker. Values that would not form a legal header after decoding are
/// left encoded.
pub fn decode_encoded_headers(headers: &mut HeaderMap) {
    let Some(list) = headers.remove(X_ENCODED_HEADERS) else {
        return;
    };
    let Ok(list) = list.to_str() else {
        warn!("Ignoring non-ASCII {} header", X_ENCODED_HEADERS);
        return;
    };

    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) else {
            continue;
        };
        let decoded: Vec<HeaderValue> = headers
            .get_all(&name)
            .iter()
            .map(|v| {
                HeaderValue::from_bytes(&percent_decode(v.as_bytes())).unwrap_or_else(|_| {
                    warn!("Header {} does not decode to a legal value", name);
                    v.clone()
                })
            })
            .collect();
        headers.remove(&name);
        for value in decoded {
            headers.append(name.clone(), value);
        }
    }
}
