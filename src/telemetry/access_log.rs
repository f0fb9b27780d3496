//! Per-request access log.

use serde::Serialize;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Line format of the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line. The default.
    Json,
    /// `$ip - [$time] "$method $path HTTP/1.1" $status - "$referer" "$ua" $cache`
    Combined,
    /// `$ip - - [$time] "$method $path HTTP/1.1" $status -`
    Common,
}

impl LogFormat {
    /// Unknown names fall back to JSON.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "combined" => LogFormat::Combined,
            "common" => LogFormat::Common,
            _ => LogFormat::Json,
        }
    }
}

/// How the page cache took part in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    /// Replayed from the page cache.
    Hit,
    /// Rendered; eligible for storage.
    Miss,
    /// Rendered without consulting the cache.
    Bypass,
    /// Answered by an upstream through a proxy route.
    Proxy,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::Proxy => "PROXY",
        }
    }
}

/// Seconds and milliseconds since the Unix epoch, e.g. `1700000000.123Z`.
pub fn log_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}Z", now.as_secs(), now.subsec_millis())
}

/// One request, as logged.
#[derive(Debug, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub request_id: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub cache: CacheStatus,
    /// Upstream URL for proxied requests (empty otherwise).
    pub upstream: String,
    pub referer: String,
    pub user_agent: String,
}

impl AccessLogEntry {
    fn as_combined(&self) -> String {
        format!(
            "{} - [{}] \"{} {} HTTP/1.1\" {} - \"{}\" \"{}\" {}",
            self.client_ip,
            self.timestamp,
            self.method,
            self.path,
            self.status,
            self.referer,
            self.user_agent,
            self.cache.as_str(),
        )
    }

    fn as_common(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} HTTP/1.1\" {} -",
            self.client_ip, self.timestamp, self.method, self.path, self.status,
        )
    }

    fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            LogFormat::Combined => self.as_combined(),
            LogFormat::Common => self.as_common(),
        }
    }
}

/// Appends access log lines to a file from a background task.
///
/// Entries queue on an unbounded channel; the task drains whatever is
/// queued, writes the batch through a buffer and flushes once per batch.
pub struct AccessLogger {
    sender: mpsc::UnboundedSender<AccessLogEntry>,
}

impl AccessLogger {
    /// Starts the writer task. Creates the log directory if it doesn't exist.
    /// Must be called from within a Tokio runtime.
    pub fn new(log_path: &str, format: LogFormat) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<AccessLogEntry>();
        tokio::spawn(write_loop(PathBuf::from(log_path), format, receiver));
        Self { sender }
    }

    /// Queues an entry. Never blocks; entries are lost if the writer died.
    pub fn log(&self, entry: AccessLogEntry) {
        let _ = self.sender.send(entry);
    }
}

async fn write_loop(
    path: PathBuf,
    format: LogFormat,
    mut receiver: mpsc::UnboundedReceiver<AccessLogEntry>,
) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to open access log {}: {}", path.display(), e);
            // Keep draining so senders never back up.
            while receiver.recv().await.is_some() {}
            return;
        }
    };
    info!("Access log: {} ({:?})", path.display(), format);

    let mut out = BufWriter::new(file);
    while let Some(first) = receiver.recv().await {
        let mut batch = vec![first];
        while let Ok(entry) = receiver.try_recv() {
            batch.push(entry);
        }
        for entry in &batch {
            let mut line = entry.render(format);
            if line.is_empty() {
                continue;
            }
            line.push('\n');
            if let Err(e) = out.write_all(line.as_bytes()).await {
                error!("Access log write failed: {}", e);
            }
        }
        if let Err(e) = out.flush().await {
            error!("Access log flush failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> AccessLogEntry {
        AccessLogEntry {
            timestamp: "1700000000.000Z".to_string(),
            request_id: "7".to_string(),
            client_ip: "127.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/product/1".to_string(),
            status: 200,
            latency_ms: 4,
            cache: CacheStatus::Hit,
            upstream: String::new(),
            referer: String::new(),
            user_agent: "curl/8".to_string(),
        }
    }

    #[test]
    fn test_formats() {
        let json: serde_json::Value =
            serde_json::from_str(&entry().render(LogFormat::Json)).unwrap();
        assert_eq!(json["cache"], "HIT");
        assert_eq!(json["request_id"], "7");
        assert!(entry().render(LogFormat::Combined).ends_with("\"curl/8\" HIT"));
        assert_eq!(
            entry().render(LogFormat::Common),
            "127.0.0.1 - - [1700000000.000Z] \"GET /product/1 HTTP/1.1\" 200 -"
        );
        assert_eq!(LogFormat::parse("COMBINED"), LogFormat::Combined);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Json);
    }

    #[tokio::test]
    async fn test_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/access.log");
        let logger = AccessLogger::new(path.to_str().unwrap(), LogFormat::Common);
        logger.log(entry());
        drop(logger);

        let mut content = String::new();
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if !content.is_empty() {
                break;
            }
        }
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("/product/1"));
    }
}
