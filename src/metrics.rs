//! Runtime metrics.
//!
//! Every event bumps a Prometheus counter (scraped from the dev server) and
//! is queued as a [`MetricDatum`]. The queue is drained to a
//! [`MetricsSink`] by [`Metrics::flush`], which the Lambda glue awaits before
//! completing an invocation.

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::error::Result;

/// Events the runtime reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricName {
    CacheHit,
    CacheMiss,
    CacheStoreFailed,
    CacheReadFailed,
    ContainerCreated,
    ContainerReused,
    ProxyRequest,
    ProxyFailure,
    CachingProxyRejected,
}

impl MetricName {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricName::CacheHit => "CacheHit",
            MetricName::CacheMiss => "CacheMiss",
            MetricName::CacheStoreFailed => "CacheStoreFailed",
            MetricName::CacheReadFailed => "CacheReadFailed",
            MetricName::ContainerCreated => "ContainerCreated",
            MetricName::ContainerReused => "ContainerReused",
            MetricName::ProxyRequest => "ProxyRequest",
            MetricName::ProxyFailure => "ProxyFailure",
            MetricName::CachingProxyRejected => "CachingProxyRejected",
        }
    }
}

/// One queued data point.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricDatum {
    pub metric_name: String,
    pub value: f64,
    pub unit: &'static str,
    pub dimensions: BTreeMap<String, String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Destination for flushed metric batches.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish(&self, batch: &[MetricDatum]) -> Result<()>;
}

/// Writes each batch as one JSON log line.
pub struct LogSink;

#[async_trait]
impl MetricsSink for LogSink {
    async fn publish(&self, batch: &[MetricDatum]) -> Result<()> {
        info!(target: "ssr_runtime::metrics", "{}", serde_json::to_string(batch)?);
        Ok(())
    }
}

/// Metric registry and send queue shared across the runtime.
pub struct Metrics {
    pub registry: Registry,
    /// Runtime events, labeled by event name.
    pub events_total: IntCounterVec,
    /// Handled requests, labeled by kind (render, cache, proxy) and status.
    pub requests_total: IntCounterVec,
    /// Request handling time in seconds, labeled by kind.
    pub request_duration: HistogramVec,
    queue: Mutex<Vec<MetricDatum>>,
    sink: Arc<dyn MetricsSink>,
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("ssr_events_total", "Runtime events by name"),
            &["name"],
        )
        .expect("valid events_total definition");

        let requests_total = IntCounterVec::new(
            Opts::new("ssr_requests_total", "Requests handled by the runtime"),
            &["kind", "status"],
        )
        .expect("valid requests_total definition");

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "ssr_request_duration_seconds",
                "Request handling latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["kind"],
        )
        .expect("valid request_duration definition");

        registry
            .register(Box::new(events_total.clone()))
            .expect("events_total registers once");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("requests_total registers once");
        registry
            .register(Box::new(request_duration.clone()))
            .expect("request_duration registers once");

        Self {
            registry,
            events_total,
            requests_total,
            request_duration,
            queue: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// Counts one occurrence of `name` and queues it for the next flush.
    pub fn send(&self, name: MetricName, dimensions: &[(&str, &str)]) {
        self.events_total.with_label_values(&[name.as_str()]).inc();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.queue.lock().push(MetricDatum {
            metric_name: name.as_str().to_string(),
            value: 1.0,
            unit: "Count",
            dimensions: dimensions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            timestamp,
        });
    }

    pub fn observe_request(&self, kind: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[kind, status.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    /// Number of data points waiting for a flush.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drains the queue to the sink. A failed publish is logged and the
    /// batch dropped.
    pub async fn flush(&self) {
        let batch = std::mem::take(&mut *self.queue.lock());
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.sink.publish(&batch).await {
            warn!("Dropping {} metric data points: {}", batch.len(), e);
        }
    }

    /// Encodes all registered metrics into Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}
