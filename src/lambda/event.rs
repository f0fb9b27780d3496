//! API Gateway proxy envelopes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Request};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::encoding::percent_encode_path;
use crate::error::{Error, Result};
use crate::headers::X_CORRELATION_ID;

/// Inbound REST API proxy event.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGatewayProxyEvent {
    #[serde(default)]
    pub http_method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub multi_value_headers: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub query_string_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub multi_value_query_string_parameters: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
    #[serde(default)]
    pub request_context: Option<RequestContext>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub identity: Option<RequestIdentity>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestIdentity {
    #[serde(default)]
    pub source_ip: Option<String>,
}

/// Outbound proxy response.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiGatewayProxyResponse {
    pub status_code: u16,
    /// Headers that carry exactly one value.
    pub headers: HashMap<String, String>,
    /// Every header, with all of its values.
    pub multi_value_headers: HashMap<String, Vec<String>>,
    pub body: String,
    pub is_base64_encoded: bool,
}

/// Invocation context handed over by the platform.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaContext {
    #[serde(default)]
    pub aws_request_id: String,
    #[serde(default)]
    pub function_name: String,
    /// When set, the platform holds the invocation open until the event
    /// loop is empty. The handler always clears it.
    #[serde(default = "default_true")]
    pub callback_waits_for_empty_event_loop: bool,
}

fn default_true() -> bool {
    true
}

impl ApiGatewayProxyEvent {
    /// All header values, multi-value entries first.
    fn header_pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::new();
        if let Some(multi) = &self.multi_value_headers {
            for (name, values) in multi {
                pairs.extend(values.iter().map(|v| (name.as_str(), v.as_str())));
            }
        }
        if let Some(single) = &self.headers {
            for (name, value) in single {
                let covered = self
                    .multi_value_headers
                    .as_ref()
                    .is_some_and(|m| m.keys().any(|k| k.eq_ignore_ascii_case(name)));
                if !covered {
                    pairs.push((name.as_str(), value.as_str()));
                }
            }
        }
        pairs
    }

    fn query_string(&self) -> Option<String> {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        let mut any = false;
        if let Some(multi) = &self.multi_value_query_string_parameters {
            let mut keys: Vec<&String> = multi.keys().collect();
            keys.sort();
            for key in keys {
                for value in &multi[key] {
                    serializer.append_pair(key, value);
                    any = true;
                }
            }
        } else if let Some(single) = &self.query_string_parameters {
            let mut keys: Vec<&String> = single.keys().collect();
            keys.sort();
            for key in keys {
                serializer.append_pair(key, &single[key]);
                any = true;
            }
        }
        any.then(|| serializer.finish())
    }

    /// The correlation id carried by the event, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.header_pairs()
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(X_CORRELATION_ID))
            .map(|(_, value)| value)
    }

    /// Converts the event into the request the runtime handles.
    pub fn to_request(&self) -> Result<Request<Bytes>> {
        let method = if self.http_method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(self.http_method.as_bytes()).map_err(hyper::http::Error::from)?
        };
        let path = if self.path.is_empty() {
            "/".to_string()
        } else {
            percent_encode_path(&self.path)
        };
        let uri = match self.query_string() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };

        let body = match &self.body {
            Some(body) if self.is_base64_encoded => Bytes::from(
                STANDARD
                    .decode(body)
                    .map_err(|e| Error::InvalidChunk(format!("invalid base64 body: {}", e)))?,
            ),
            Some(body) => Bytes::from(body.clone()),
            None => Bytes::new(),
        };

        let mut req = Request::builder().method(method).uri(uri).body(body)?;
        for (name, value) in self.header_pairs() {
            let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(hyper::http::Error::from)?;
            let value = HeaderValue::from_str(value).map_err(hyper::http::Error::from)?;
            req.headers_mut().append(name, value);
        }

        let source_ip = self
            .request_context
            .as_ref()
            .and_then(|ctx| ctx.identity.as_ref())
            .and_then(|identity| identity.source_ip.as_deref())
            .and_then(|ip| ip.parse::<IpAddr>().ok());
        if let Some(ip) = source_ip {
            req.extensions_mut().insert(SocketAddr::new(ip, 0));
        }
        Ok(req)
    }
}
