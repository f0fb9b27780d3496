//! Page renderers.
//!
//! The runtime hands every non-proxied request that missed the cache to a
//! [`Renderer`]. Applications plug in their own; the dev server defaults to
//! [`StaticSiteRenderer`], which serves a prebuilt site directory.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, ALLOW, CONTENT_ENCODING, CONTENT_TYPE, VARY};
use hyper::{Method, Request, StatusCode};
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::compression::{accepts_gzip, gzip_compress, is_compressible};
use crate::encoding::percent_decode;
use crate::error::Result;
use crate::headers::header_str;
use crate::response::ResponseWriter;

/// Produces the response for one request.
///
/// Implementations must end `res` on success. Returning an error before the
/// headers were sent lets the runtime answer with a 500 instead.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, req: &Request<Bytes>, res: &mut ResponseWriter) -> Result<()>;
}

/// Resolves the percent-encoded request path `requested` below `base`,
/// rejecting anything that escapes it.
pub async fn sanitize_path(base: &Path, requested: &str) -> Option<PathBuf> {
    let req_path = requested.split('?').next().unwrap_or("");
    let decoded = String::from_utf8(percent_decode(req_path.as_bytes())).ok()?;
    if decoded.contains('\0') {
        return None;
    }
    let full_path = base.join(decoded.trim_start_matches('/'));

    // Canonicalize to resolve symlinks and ../
    let canon = tokio::fs::canonicalize(&full_path).await.ok()?;
    let canon_base = tokio::fs::canonicalize(base)
        .await
        .unwrap_or_else(|_| base.to_path_buf());
    if canon.starts_with(canon_base) {
        Some(canon)
    } else {
        None
    }
}

/// Serves files from a prebuilt site directory.
pub struct StaticSiteRenderer {
    root: PathBuf,
    gzip: bool,
    chunk_size: usize,
}

impl StaticSiteRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            gzip: false,
            chunk_size: 16 * 1024,
        }
    }

    /// Compress compressible files for clients that accept gzip.
    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn resolve(&self, path: &str) -> Option<PathBuf> {
        let found = sanitize_path(&self.root, path).await?;
        let is_dir = tokio::fs::metadata(&found).await.ok()?.is_dir();
        if is_dir {
            sanitize_path(&self.root, &format!("{}/index.html", path.trim_end_matches('/'))).await
        } else {
            Some(found)
        }
    }
}

#[async_trait]
impl Renderer for StaticSiteRenderer {
    async fn render(&self, req: &Request<Bytes>, res: &mut ResponseWriter) -> Result<()> {
        let method = req.method();
        if method != Method::GET && method != Method::HEAD {
            res.set_status(StatusCode::METHOD_NOT_ALLOWED)?;
            res.insert_header(ALLOW, HeaderValue::from_static("GET, HEAD"))?;
            return res.end();
        }

        let Some(file_path) = self.resolve(req.uri().path()).await else {
            debug!("No static file for {}", req.uri().path());
            res.set_status(StatusCode::NOT_FOUND)?;
            res.set_header("content-type", "text/plain; charset=utf-8")?;
            return res.end_with("Not Found");
        };

        let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
        res.set_header("content-type", mime.as_ref())?;

        let wants_gzip = self.gzip
            && is_compressible(Some(mime.as_ref()))
            && accepts_gzip(header_str(req.headers(), ACCEPT_ENCODING.as_str()));

        if wants_gzip {
            let body = tokio::fs::read(&file_path).await?;
            res.insert_header(VARY, HeaderValue::from_static("accept-encoding"))?;
            let body = match gzip_compress(&body) {
                Some(compressed) => {
                    res.insert_header(CONTENT_ENCODING, HeaderValue::from_static("gzip"))?;
                    compressed
                }
                None => Bytes::from(body),
            };
            if method == Method::HEAD {
                return res.end();
            }
            for chunk in body.chunks(self.chunk_size) {
                res.write(Bytes::copy_from_slice(chunk))?;
            }
            return res.end();
        }

        if method == Method::HEAD {
            return res.end();
        }

        let file = tokio::fs::File::open(&file_path).await?;
        let mut stream = ReaderStream::with_capacity(file, self.chunk_size);
        while let Some(chunk) = stream.next().await {
            res.write_paced(chunk?).await?;
        }
        debug!(
            "Served {} as {}",
            file_path.display(),
            header_str(res.headers(), CONTENT_TYPE.as_str()).unwrap_or("-")
        );
        res.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>home</html>").unwrap();
        std::fs::write(dir.path().join("docs/index.html"), "<html>docs</html>").unwrap();
        std::fs::write(dir.path().join("app.css"), "body{}".repeat(400)).unwrap();
        dir
    }

    async fn render(renderer: &StaticSiteRenderer, req: Request<Bytes>) -> (u16, String, Bytes) {
        let (mut res, pending) = ResponseWriter::new("t", true);
        renderer.render(&req, &mut res).await.unwrap();
        let (head, body) = pending.collect().await;
        let ct = head
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        (head.status.as_u16(), ct, body)
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::get(path).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_index_for_directories() {
        let dir = site();
        let renderer = StaticSiteRenderer::new(dir.path()).with_chunk_size(4);

        let (status, ct, body) = render(&renderer, get("/")).await;
        assert_eq!(status, 200);
        assert_eq!(ct, "text/html");
        assert_eq!(&body[..], b"<html>home</html>");

        let (_, _, body) = render(&renderer, get("/docs/")).await;
        assert_eq!(&body[..], b"<html>docs</html>");
    }

    #[tokio::test]
    async fn test_missing_and_traversal_are_not_found() {
        let dir = site();
        let renderer = StaticSiteRenderer::new(dir.path().join("docs"));

        let (status, _, _) = render(&renderer, get("/nope.html")).await;
        assert_eq!(status, 404);
        let (status, _, _) = render(&renderer, get("/../index.html")).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_encoded_paths_are_decoded() {
        let dir = site();
        std::fs::write(dir.path().join("my file.html"), "<html>spaced</html>").unwrap();
        std::fs::create_dir_all(dir.path().join("café")).unwrap();
        std::fs::write(dir.path().join("café/index.html"), "<html>menu</html>").unwrap();
        let renderer = StaticSiteRenderer::new(dir.path());

        let (status, ct, body) = render(&renderer, get("/my%20file.html")).await;
        assert_eq!(status, 200);
        assert_eq!(ct, "text/html");
        assert_eq!(&body[..], b"<html>spaced</html>");

        let (status, _, body) = render(&renderer, get("/caf%C3%A9/")).await;
        assert_eq!(status, 200);
        assert_eq!(&body[..], b"<html>menu</html>");

        let docs = StaticSiteRenderer::new(dir.path().join("docs"));
        let (status, _, _) = render(&docs, get("/%2E%2E/index.html")).await;
        assert_eq!(status, 404);
        let (status, _, _) = render(&docs, get("/..%2Findex.html")).await;
        assert_eq!(status, 404);
        let (status, _, _) = render(&renderer, get("/index.html%00")).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_large_files_stream_intact() {
        let dir = site();
        let page = "<p>row</p>".repeat(40_000);
        std::fs::write(dir.path().join("big.html"), &page).unwrap();
        let renderer = StaticSiteRenderer::new(dir.path());

        let (mut res, pending) = ResponseWriter::new("t", true);
        let reader = tokio::spawn(pending.collect());
        renderer.render(&get("/big.html"), &mut res).await.unwrap();
        let (head, body) = reader.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(body.len(), page.len());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_methods() {
        let dir = site();
        let renderer = StaticSiteRenderer::new(dir.path());
        let req = Request::post("/").body(Bytes::new()).unwrap();
        let (status, _, body) = render(&renderer, req).await;
        assert_eq!(status, 405);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_gzip_when_accepted() {
        let dir = site();
        let renderer = StaticSiteRenderer::new(dir.path()).with_gzip(true);
        let req = Request::get("/app.css")
            .header("accept-encoding", "gzip")
            .body(Bytes::new())
            .unwrap();

        let (mut res, pending) = ResponseWriter::new("t", true);
        renderer.render(&req, &mut res).await.unwrap();
        let (head, body) = pending.collect().await;
        assert_eq!(head.headers["content-encoding"], "gzip");

        let mut out = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut out).unwrap();
        assert_eq!(out, "body{}".repeat(400));
    }
}
