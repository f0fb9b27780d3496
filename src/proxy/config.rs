//! Proxy target definitions and their route prefixes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Upper bound on configured proxies.
pub const MAX_PROXY_CONFIGS: usize = 8;

/// Route prefix of plain proxies: `/__proxy/<path>/...`.
pub const PROXY_PATH_PREFIX: &str = "/__proxy";

/// Route prefix of caching proxies: `/__caching/<path>/...`.
pub const CACHING_PATH_PREFIX: &str = "/__caching";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(Error::Config(format!(
                "Invalid proxy protocol '{}': must be http or https",
                other
            ))),
        }
    }
}

/// One upstream target reachable under `/__proxy/<path>` and
/// `/__caching/<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub protocol: Protocol,
    /// Upstream authority, `host` or `host:port`.
    pub host: String,
    /// Route segment naming this target.
    pub path: String,
    pub proxy_path: String,
    pub caching_path: String,
}

impl ProxyConfig {
    pub fn new(protocol: &str, host: &str, path: &str) -> Result<Self> {
        let protocol: Protocol = protocol.parse()?;
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::Config(format!(
                "Proxy '{}' has no host",
                path
            )));
        }
        if host.contains('/') || host.contains(char::is_whitespace) {
            return Err(Error::Config(format!("Invalid proxy host '{}'", host)));
        }
        let path = path.trim_matches('/');
        if path.is_empty()
            || !path
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(Error::Config(format!("Invalid proxy path '{}'", path)));
        }

        Ok(Self {
            protocol,
            host: host.to_ascii_lowercase(),
            path: path.to_string(),
            proxy_path: format!("{}/{}", PROXY_PATH_PREFIX, path),
            caching_path: format!("{}/{}", CACHING_PATH_PREFIX, path),
        })
    }

    /// Parses `<protocol>://<host>/<path>`.
    pub fn parse(definition: &str) -> Result<Self> {
        let (protocol, rest) = definition
            .trim()
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("Invalid proxy definition '{}'", definition)))?;
        let (host, path) = rest.split_once('/').ok_or_else(|| {
            Error::Config(format!("Proxy definition '{}' has no path", definition))
        })?;
        Self::new(protocol, host, path)
    }

    /// `<protocol>://<host>` of the upstream.
    pub fn target_origin(&self) -> String {
        format!("{}://{}", self.protocol, self.host)
    }

    /// Host name of the upstream without any port.
    pub fn target_hostname(&self) -> &str {
        self.host.split(':').next().unwrap_or(&self.host)
    }
}

/// Checks the whole proxy table: bounded size and unique paths.
pub fn validate_proxy_configs(configs: &[ProxyConfig]) -> Result<()> {
    if configs.len() > MAX_PROXY_CONFIGS {
        return Err(Error::Config(format!(
            "{} proxies configured, at most {} are allowed",
            configs.len(),
            MAX_PROXY_CONFIGS
        )));
    }
    let mut seen = HashSet::new();
    for config in configs {
        if !seen.insert(config.path.as_str()) {
            return Err(Error::Config(format!(
                "Duplicate proxy path '{}'",
                config.path
            )));
        }
    }
    Ok(())
}

/// Reads `SSR_PROXY1`..`SSR_PROXY8` through `lookup`, in order. Gaps are
/// skipped.
pub fn proxy_configs_from_env<F>(lookup: F) -> Result<Vec<ProxyConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut configs = Vec::new();
    for i in 1..=MAX_PROXY_CONFIGS {
        if let Some(definition) = lookup(&format!("SSR_PROXY{}", i)) {
            if !definition.trim().is_empty() {
                configs.push(ProxyConfig::parse(&definition)?);
            }
        }
    }
    Ok(configs)
}

/// Which route variant matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Standard,
    Caching,
}

impl ProxyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyKind::Standard => "proxy",
            ProxyKind::Caching => "caching",
        }
    }
}

/// A request path resolved to a proxy target.
#[derive(Debug, Clone)]
pub struct ProxyMatch<'a> {
    pub config: &'a ProxyConfig,
    pub kind: ProxyKind,
    /// Path below the route prefix, always starting with `/`.
    pub upstream_path: String,
}

/// The validated set of proxies. Swapped whole on reload.
#[derive(Debug, Clone, Default)]
pub struct ProxyTable {
    configs: Vec<ProxyConfig>,
}

impl ProxyTable {
    pub fn new(configs: Vec<ProxyConfig>) -> Result<Self> {
        validate_proxy_configs(&configs)?;
        Ok(Self { configs })
    }

    pub fn configs(&self) -> &[ProxyConfig] {
        &self.configs
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Resolves `path` against every proxy and caching prefix.
    pub fn match_path(&self, path: &str) -> Option<ProxyMatch<'_>> {
        for config in &self.configs {
            for (prefix, kind) in [
                (&config.proxy_path, ProxyKind::Standard),
                (&config.caching_path, ProxyKind::Caching),
            ] {
                let Some(rest) = path.strip_prefix(prefix.as_str()) else {
                    continue;
                };
                if rest.is_empty() || rest.starts_with('/') {
                    return Some(ProxyMatch {
                        config,
                        kind,
                        upstream_path: if rest.is_empty() {
                            "/".to_string()
                        } else {
                            rest.to_string()
                        },
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_definition() {
        let config = ProxyConfig::parse("https://api.example.com/api").unwrap();
        assert_eq!(config.protocol, Protocol::Https);
        assert_eq!(config.host, "api.example.com");
        assert_eq!(config.proxy_path, "/__proxy/api");
        assert_eq!(config.caching_path, "/__caching/api");
        assert_eq!(config.target_origin(), "https://api.example.com");
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(matches!(
            ProxyConfig::parse("ftp://files.example.com/files"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ProxyConfig::new("https", "", "api"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ProxyConfig::parse("https://api.example.com"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ProxyConfig::new("http", "api.example.com", "a/b"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let configs = vec![
            ProxyConfig::parse("https://a.example.com/api").unwrap(),
            ProxyConfig::parse("https://b.example.com/api").unwrap(),
        ];
        let err = ProxyTable::new(configs).unwrap_err();
        assert!(err.to_string().contains("Duplicate proxy path 'api'"));
    }

    #[test]
    fn test_too_many_proxies_rejected() {
        let configs: Vec<_> = (0..=MAX_PROXY_CONFIGS)
            .map(|i| ProxyConfig::new("http", "h.example.com", &format!("p{}", i)).unwrap())
            .collect();
        assert!(matches!(ProxyTable::new(configs), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_definitions() {
        let env: HashMap<&str, &str> = [
            ("SSR_PROXY1", "https://api.example.com/api"),
            ("SSR_PROXY3", "http://images.example.com:8080/images"),
        ]
        .into_iter()
        .collect();
        let configs = proxy_configs_from_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].host, "images.example.com:8080");
        assert_eq!(configs[1].target_hostname(), "images.example.com");
    }

    #[test]
    fn test_match_path() {
        let table = ProxyTable::new(vec![ProxyConfig::parse("https://api.example.com/api").unwrap()])
            .unwrap();

        let m = table.match_path("/__caching/api/v1/products").unwrap();
        assert_eq!(m.kind, ProxyKind::Caching);
        assert_eq!(m.upstream_path, "/v1/products");

        let m = table.match_path("/__proxy/api").unwrap();
        assert_eq!(m.kind, ProxyKind::Standard);
        assert_eq!(m.upstream_path, "/");

        assert!(table.match_path("/__proxy/apix/v1").is_none());
        assert!(table.match_path("/product/1").is_none());
    }
}
