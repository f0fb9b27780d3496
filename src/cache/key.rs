//! Page cache key derivation.

use hyper::header::{HeaderMap, USER_AGENT};
use hyper::Uri;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

use crate::headers::{header_str, X_QUERYSTRING, X_REQUEST_CLASS};

/// Device family derived from the `User-Agent` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceType {
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        static TABLET: OnceLock<Option<Regex>> = OnceLock::new();
        static MOBILE: OnceLock<Option<Regex>> = OnceLock::new();

        let Some(ua) = user_agent else {
            return DeviceType::Desktop;
        };
        let tablet = TABLET.get_or_init(|| {
            Regex::new(r"(?i)ipad|tablet|playbook|silk").ok()
        });
        // Android without "mobile" is a tablet; `regex` has no look-ahead.
        let lower = ua.to_ascii_lowercase();
        let tablet_match = tablet.as_ref().is_some_and(|re| re.is_match(ua))
            || (lower.contains("android") && !lower.contains("mobile"));
        if tablet_match {
            return DeviceType::Tablet;
        }

        let mobile = MOBILE.get_or_init(|| {
            Regex::new(r"(?i)mobi|iphone|ipod|android|blackberry|iemobile|opera mini|windows phone")
                .ok()
        });
        if mobile.as_ref().is_some_and(|re| re.is_match(ua)) {
            return DeviceType::Mobile;
        }
        DeviceType::Desktop
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that shape a page cache key beyond the URL.
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub ignore_device_type: bool,
    pub ignore_request_class: bool,
    /// Caller-supplied values folded into the key in order.
    pub extras: Vec<String>,
}

impl KeyOptions {
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extras.push(extra.into());
        self
    }
}

/// Query string with its pairs sorted, so parameter order never changes the
/// key. The edge-supplied `x-ssr-querystring` wins over the URL's own.
pub fn normalized_query(uri: &Uri, headers: &HeaderMap) -> String {
    let raw = header_str(headers, X_QUERYSTRING)
        .or_else(|| uri.query())
        .unwrap_or("");
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect();
    pairs.sort();
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Feeds one tagged, length-prefixed field to the digest, so no value can
/// spill into the next field.
fn hash_field(hasher: &mut Sha256, tag: &str, value: &str) {
    hasher.update(tag.as_bytes());
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Derives the key for a page request.
///
/// The key is `<path>/<sha256>` where the digest covers the path, sorted
/// query, device type and request class (unless ignored) and the extras.
pub fn generate_cache_key(uri: &Uri, headers: &HeaderMap, options: &KeyOptions) -> String {
    let path = uri.path();
    let mut hasher = Sha256::new();
    hash_field(&mut hasher, "path", path);
    hash_field(&mut hasher, "query", &normalized_query(uri, headers));

    if !options.ignore_device_type {
        let device = DeviceType::from_user_agent(header_str(headers, USER_AGENT.as_str()));
        hash_field(&mut hasher, "device", device.as_str());
    }
    if !options.ignore_request_class {
        let class = header_str(headers, X_REQUEST_CLASS).unwrap_or("");
        hash_field(&mut hasher, "class", class);
    }
    hasher.update((options.extras.len() as u64).to_le_bytes());
    for extra in &options.extras {
        hash_field(&mut hasher, "extra", extra);
    }

    let hash: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}/{}", path.trim_end_matches('/'), hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderName, HeaderValue};

    fn key(uri: &str, headers: &[(&str, &str)], options: &KeyOptions) -> String {
        let uri: Uri = uri.parse().unwrap();
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        generate_cache_key(&uri, &map, options)
    }

    #[test]
    fn test_key_is_deterministic() {
        let opts = KeyOptions::default();
        let a = key(
            "/product/1?b=2&a=1",
            &[("accept", "text/html"), (X_REQUEST_CLASS, "bot")],
            &opts,
        );
        let b = key(
            "/product/1?a=1&b=2",
            &[(X_REQUEST_CLASS, "bot"), ("accept", "text/html")],
            &opts,
        );
        assert_eq!(a, b);
        assert!(a.starts_with("/product/1/"));
    }

    #[test]
    fn test_each_component_changes_key() {
        let opts = KeyOptions::default();
        let base = key("/p?a=1", &[(X_REQUEST_CLASS, "bot")], &opts);
        assert_ne!(base, key("/q?a=1", &[(X_REQUEST_CLASS, "bot")], &opts));
        assert_ne!(base, key("/p?a=2", &[(X_REQUEST_CLASS, "bot")], &opts));
        assert_ne!(base, key("/p?a=1", &[(X_REQUEST_CLASS, "human")], &opts));
        assert_ne!(
            base,
            key(
                "/p?a=1",
                &[(X_REQUEST_CLASS, "bot")],
                &KeyOptions::default().with_extra("en-GB")
            )
        );
    }

    #[test]
    fn test_extras_are_positional() {
        let ab = KeyOptions::default().with_extra("a").with_extra("b");
        let ba = KeyOptions::default().with_extra("b").with_extra("a");
        assert_ne!(key("/p", &[], &ab), key("/p", &[], &ba));
    }

    #[test]
    fn test_extra_with_newline_does_not_alias_two_extras() {
        let joined = KeyOptions::default().with_extra("x\nex1=y");
        let split = KeyOptions::default().with_extra("x").with_extra("y");
        assert_ne!(key("/p", &[], &joined), key("/p", &[], &split));

        let shifted = KeyOptions::default().with_extra("xy");
        let pair = KeyOptions::default().with_extra("x").with_extra("y");
        assert_ne!(key("/p", &[], &shifted), key("/p", &[], &pair));
    }

    #[test]
    fn test_ignore_request_class() {
        let opts = KeyOptions {
            ignore_request_class: true,
            ..Default::default()
        };
        assert_eq!(
            key("/p", &[(X_REQUEST_CLASS, "bot")], &opts),
            key("/p", &[(X_REQUEST_CLASS, "human")], &opts)
        );
    }

    #[test]
    fn test_querystring_override() {
        let opts = KeyOptions::default();
        assert_eq!(
            key("/p?utm=x&a=1", &[(X_QUERYSTRING, "a=1")], &opts),
            key("/p?a=1", &[], &opts)
        );
    }

    #[test]
    fn test_device_type() {
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148";
        let ipad = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X)";
        let android_tablet = "Mozilla/5.0 (Linux; Android 13; SM-X700)";
        let desktop = "Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0";
        assert_eq!(DeviceType::from_user_agent(Some(iphone)), DeviceType::Mobile);
        assert_eq!(DeviceType::from_user_agent(Some(ipad)), DeviceType::Tablet);
        assert_eq!(
            DeviceType::from_user_agent(Some(android_tablet)),
            DeviceType::Tablet
        );
        assert_eq!(DeviceType::from_user_agent(Some(desktop)), DeviceType::Desktop);
        assert_eq!(DeviceType::from_user_agent(None), DeviceType::Desktop);

        let opts = KeyOptions::default();
        assert_ne!(
            key("/p", &[("user-agent", iphone)], &opts),
            key("/p", &[("user-agent", desktop)], &opts)
        );
    }
}
