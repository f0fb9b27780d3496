//! Response compression helpers.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use tracing::debug;

/// Whether `Accept-Encoding` admits gzip, directly or through `*`.
/// `gzip;q=0` is a refusal.
pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    let Some(ae) = accept_encoding else {
        return false;
    };
    ae.split(',').any(|part| {
        let mut pieces = part.split(';').map(str::trim);
        let coding = pieces.next().unwrap_or("").to_ascii_lowercase();
        if coding != "gzip" && coding != "*" {
            return false;
        }
        !pieces.any(|p| {
            p.strip_prefix("q=")
                .and_then(|q| q.parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        })
    })
}

/// Whether a body of this type is worth compressing: text, JSON, JavaScript,
/// XML and SVG.
pub fn is_compressible(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else {
        return false;
    };
    let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    essence.starts_with("text/")
        || essence.ends_with("+xml")
        || essence.ends_with("+json")
        || matches!(
            essence.as_str(),
            "application/json" | "application/javascript" | "application/xml"
        )
}

/// Bodies smaller than this are sent uncompressed.
pub const MIN_COMPRESS_SIZE: usize = 1024;

/// Gzips `body`. `None` when the body is under [`MIN_COMPRESS_SIZE`], when
/// compression fails, or when it would not make the body smaller.
pub fn gzip_compress(body: &[u8]) -> Option<Bytes> {
    if body.len() < MIN_COMPRESS_SIZE {
        return None;
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::fast());
    encoder.write_all(body).ok()?;
    let compressed = encoder.finish().ok()?;
    if compressed.len() >= body.len() {
        return None;
    }
    debug!("gzip: {} -> {} bytes", body.len(), compressed.len());
    Some(Bytes::from(compressed))
}
