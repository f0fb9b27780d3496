//! Local development server.

pub mod tls;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::response::{text_response, ResponseBody};
use crate::runtime::SsrRuntime;

/// How long shutdown waits for in-flight responses and cache writes.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds the listener named by `listen`.
pub async fn bind(listen: &str) -> Result<TcpListener> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address '{}': {}", listen, e)))?;
    Ok(TcpListener::bind(addr).await?)
}

/// Accepts connections until `shutdown` fires, then waits (bounded by
/// [`DRAIN_TIMEOUT`]) for pending responses and flushes metrics.
pub async fn serve(
    runtime: Arc<SsrRuntime>,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(
        "SSR dev server listening on {}://{}",
        if tls_acceptor.is_some() { "https" } else { "http" },
        addr
    );

    loop {
        // Accept new connections, or break on shutdown signal
        let (stream, peer) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(s) => s,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Dev server shutting down, no new connections accepted.");
                break;
            }
        };

        let runtime = Arc::clone(&runtime);
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(tls_stream, peer, runtime).await,
                    Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
                },
                None => serve_connection(stream, peer, runtime).await,
            }
        });
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, runtime.monitor().wait_for_responses()).await {
        Ok(()) => debug!("All responses drained"),
        Err(_) => warn!(
            "Gave up waiting for {} pending responses",
            runtime.monitor().pending_count()
        ),
    }
    runtime.metrics().flush().await;
    Ok(())
}

async fn serve_connection<S>(stream: S, peer: SocketAddr, runtime: Arc<SsrRuntime>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req: Request<Incoming>| {
        let runtime = Arc::clone(&runtime);
        async move { Ok::<_, Infallible>(handle_request(req, peer, runtime).await) }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
        debug!("Error serving HTTP/1 connection from {}: {:?}", peer, e);
    }
}

async fn handle_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    runtime: Arc<SsrRuntime>,
) -> Response<ResponseBody> {
    let (parts, body) = req.into_parts();
    let body: Bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read request body from {}: {}", peer, e);
            return text_response(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };
    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(peer);
    runtime.handle(req).await
}
