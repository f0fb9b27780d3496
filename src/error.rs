//! Error types for the SSR runtime.

use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the runtime.
///
/// Configuration errors are fatal at startup. Store and upstream errors are
/// caught at their boundary and never reach the client as anything other
/// than a miss or a 500. The remaining variants flag misuse by calling code.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The persistent cache store failed a read or write
    #[error("Cache store error: {0}")]
    Store(String),

    /// An upstream proxy target could not be reached
    #[error("Upstream request to {url} failed: {reason}")]
    Upstream { url: String, reason: String },

    /// `send` was called on a cache lookup that found nothing
    #[error("Cannot send cached response for key '{key}': entry was not found")]
    CacheEntryNotFound { key: String },

    /// A chunk that cannot be captured was written to a captured response
    #[error("Unexpected type of chunk written to captured response: {0}")]
    UnexpectedChunkType(&'static str),

    /// Response capture was installed twice on the same response
    #[error("Response capture is already installed on this response")]
    CaptureAlreadyInstalled,

    /// A string chunk named an encoding the runtime does not know
    #[error("Unknown chunk encoding '{0}'")]
    UnknownEncoding(String),

    /// A string chunk could not be decoded with its declared encoding
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// Status or headers were changed after they were sent
    #[error("Cannot modify status or headers after they are sent")]
    HeadersSent,

    /// A write or end was attempted after the response ended
    #[error("Response has already finished")]
    ResponseFinished,

    /// The application renderer failed
    #[error("Render failed: {0}")]
    Render(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP message construction error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
}

impl Error {
    /// Shorthand for building an [`Error::Store`] from anything printable.
    pub fn store(reason: impl std::fmt::Display) -> Self {
        Error::Store(reason.to_string())
    }
}
