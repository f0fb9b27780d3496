//! Response capture: mirrors every chunk written to a response so the exact
//! bytes sent to the client can be persisted once the response finishes.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use bytes::{Bytes, BytesMut};
use hyper::header::HeaderMap;

use crate::error::{Error, Result};

/// Character encoding of a string chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    /// One byte per code point, truncated to 8 bits. Also known as `binary`.
    Latin1,
    Base64,
    Hex,
    /// Also known as `ucs2`.
    Utf16Le,
}

impl Encoding {
    /// Parses an encoding name. Names are case-insensitive and accept the
    /// usual aliases (`utf-8`, `binary`, `ucs2`, ...).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "base64" => Ok(Encoding::Base64),
            "hex" => Ok(Encoding::Hex),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Encoding::Utf16Le),
            _ => Err(Error::UnknownEncoding(name.to_string())),
        }
    }

    /// Converts `text` into the bytes it denotes under this encoding.
    pub fn encode(self, text: &str) -> Result<Bytes> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Ascii | Encoding::Latin1 => {
                Ok(text.chars().map(|c| (c as u32 & 0xff) as u8).collect())
            }
            Encoding::Base64 => {
                let trimmed = text.trim_end_matches('=');
                STANDARD
                    .decode(text)
                    .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
                    .map(Bytes::from)
                    .map_err(|e| Error::InvalidChunk(format!("invalid base64: {}", e)))
            }
            Encoding::Hex => decode_hex(text).map(Bytes::from),
            Encoding::Utf16Le => {
                let mut out = BytesMut::with_capacity(text.len() * 2);
                for unit in text.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                Ok(out.freeze())
            }
        }
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(Error::InvalidChunk("hex string has odd length".to_string()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::InvalidChunk(format!("invalid hex at offset {}", i)))
        })
        .collect()
}

/// One write to a response.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// A string, converted to bytes with `encoding`.
    Text { text: String, encoding: Encoding },
    /// Raw bytes, sent as-is.
    Binary(Bytes),
    /// Trailing headers. Forwarded to the client but never capturable.
    Trailers(HeaderMap),
}

impl Chunk {
    /// A string chunk with an explicit encoding name.
    pub fn encoded(text: impl Into<String>, encoding: &str) -> Result<Self> {
        Ok(Chunk::Text {
            text: text.into(),
            encoding: Encoding::from_name(encoding)?,
        })
    }

    /// The bytes this chunk puts on the wire, or `None` for trailers.
    pub fn to_bytes(&self) -> Result<Option<Bytes>> {
        match self {
            Chunk::Text { text, encoding } => encoding.encode(text).map(Some),
            Chunk::Binary(bytes) => Ok(Some(bytes.clone())),
            Chunk::Trailers(_) => Ok(None),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Chunk::Text { .. } => "string",
            Chunk::Binary(_) => "bytes",
            Chunk::Trailers(_) => "trailers",
        }
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Chunk::Text {
            text: text.to_string(),
            encoding: Encoding::Utf8,
        }
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Chunk::Text {
            text,
            encoding: Encoding::Utf8,
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Binary(bytes)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Binary(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Chunk {
    fn from(bytes: &[u8]) -> Self {
        Chunk::Binary(Bytes::copy_from_slice(bytes))
    }
}

/// The ordered byte buffers written to one response.
///
/// Owned by a single `ResponseWriter` for the life of its request.
#[derive(Debug, Default)]
pub struct ResponseCapture {
    chunks: Vec<Bytes>,
}

impl ResponseCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the bytes of `chunk`, returning them for forwarding.
    ///
    /// Chunks that carry no body bytes (trailers) are rejected so a cache
    /// entry is never built from a body that silently lost data.
    pub fn record(&mut self, chunk: &Chunk) -> Result<Bytes> {
        match chunk.to_bytes()? {
            Some(bytes) => {
                self.chunks.push(bytes.clone());
                Ok(bytes)
            }
            None => Err(Error::UnexpectedChunkType(chunk.kind())),
        }
    }

    /// Number of chunks recorded so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total bytes recorded so far.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenates the recorded chunks in write order.
    pub fn into_bytes(self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks.into_iter().next().unwrap_or_default();
        }
        let mut out = BytesMut::with_capacity(self.len());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}
