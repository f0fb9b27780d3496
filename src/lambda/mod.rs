//! Per-invocation glue for running the runtime inside a serverless
//! container.
//!
//! Returning from [`LambdaHandler::handle`] is the completion signal, so
//! everything that must happen for an invocation (pending responses, cache
//! writes, metrics) is awaited before it returns. Nothing may be scheduled
//! to run after: a frozen container may never resume it.

pub mod event;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::BodyExt;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use self::event::{ApiGatewayProxyEvent, ApiGatewayProxyResponse, LambdaContext};
use crate::encoding::{
    encode_unsafe_headers, is_binary_content_type, normalize_binary, restore_content_type,
};
use crate::error::Result;
use crate::headers::{header_str, X_CORRELATION_ID};
use crate::metrics::MetricName;
use crate::runtime::SsrRuntime;

/// Serves API Gateway events through one [`SsrRuntime`] for the lifetime
/// of a container.
pub struct LambdaHandler {
    runtime: Arc<SsrRuntime>,
    container_reused: AtomicBool,
}

impl LambdaHandler {
    pub fn new(runtime: Arc<SsrRuntime>) -> Self {
        Self {
            runtime,
            container_reused: AtomicBool::new(false),
        }
    }

    pub fn runtime(&self) -> &Arc<SsrRuntime> {
        &self.runtime
    }

    /// Whether at least one invocation already ran in this container.
    pub fn is_reused(&self) -> bool {
        self.container_reused.load(Ordering::SeqCst)
    }

    /// Handles one invocation.
    pub async fn handle(
        &self,
        event: ApiGatewayProxyEvent,
        context: &mut LambdaContext,
    ) -> Result<ApiGatewayProxyResponse> {
        context.callback_waits_for_empty_event_loop = false;

        let metrics = self.runtime.metrics();
        if self.container_reused.swap(true, Ordering::SeqCst) {
            debug!("Container reused for {}", context.aws_request_id);
            if let Err(e) = self.runtime.housekeeping().await {
                warn!("Cache housekeeping failed: {}", e);
            }
            metrics.send(MetricName::ContainerReused, &[]);
        } else {
            info!("Container created for {}", context.aws_request_id);
            metrics.send(MetricName::ContainerCreated, &[]);
        }

        let correlation_id = event.correlation_id().map(str::to_string);
        let req = event.to_request()?;
        let resp = self.runtime.handle(req).await;
        let (parts, body) = resp.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };

        self.runtime.monitor().wait_for_responses().await;
        metrics.flush().await;

        let mut headers = parts.headers;
        normalize_binary(&mut headers);
        let binary = is_binary_content_type(header_str(&headers, CONTENT_TYPE.as_str()));
        let (body, is_base64_encoded) = if binary {
            (STANDARD.encode(&body), true)
        } else {
            match String::from_utf8(body.to_vec()) {
                Ok(text) => (text, false),
                Err(_) => (STANDARD.encode(&body), true),
            }
        };
        restore_content_type(&mut headers);
        encode_unsafe_headers(&mut headers);
        if let Some(id) = correlation_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
            headers.insert(HeaderName::from_static(X_CORRELATION_ID), id);
        }

        let mut multi_value_headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in &headers {
            let value = value
                .to_str()
                .map(str::to_string)
                .unwrap_or_else(|_| String::from_utf8_lossy(value.as_bytes()).into_owned());
            multi_value_headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value);
        }
        let single_headers = multi_value_headers
            .iter()
            .filter(|(_, values)| values.len() == 1)
            .map(|(name, values)| (name.clone(), values[0].clone()))
            .collect();

        Ok(ApiGatewayProxyResponse {
            status_code: parts.status.as_u16(),
            headers: single_headers,
            multi_value_headers,
            body,
            is_base64_encoded,
        })
    }

    /// [`LambdaHandler::handle`] over raw JSON envelopes.
    pub async fn handle_json(&self, event: &str, context: &mut LambdaContext) -> Result<String> {
        let event: ApiGatewayProxyEvent = serde_json::from_str(event)?;
        let response = self.handle(event, context).await?;
        Ok(serde_json::to_string(&response)?)
    }
}
