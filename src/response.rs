//! The outbound response handed to renderers.
//!
//! [`ResponseWriter`] wraps one response: status and headers are buffered
//! until the first write (or `end`), after which body frames stream to the
//! paired [`PendingResponse`]. Capture, cookie policy and completion hooks
//! all live on the writer, so nothing is patched onto shared state.
//!
//! `write` never blocks. Bytes the client has not read yet are counted, and
//! streaming renderers pace themselves with [`ResponseWriter::write_paced`]
//! (or `needs_drain` + `drained`) so at most [`HIGH_WATER_MARK`] bytes sit
//! in memory per response.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LOCATION, SET_COOKIE};
use hyper::{Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::capture::{Chunk, ResponseCapture};
use crate::error::{Error, Result};
use crate::monitor::ResponseTracker;

/// Unread body bytes above which a writer should wait for the client.
pub const HIGH_WATER_MARK: u64 = 64 * 1024;

/// Unread byte count shared by a writer and its body.
#[derive(Default)]
struct FlowState {
    buffered: AtomicU64,
    drained: Notify,
}

impl FlowState {
    fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }
}

/// Body type of every response the runtime produces.
pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// Builds a response body from a complete buffer.
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).boxed()
}

/// An empty response with the given status.
pub fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    let mut resp = Response::new(Empty::<Bytes>::new().boxed());
    *resp.status_mut() = status;
    resp
}

/// A `text/plain` response with the given status and message.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ResponseBody> {
    let mut resp = Response::new(full_body(message.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Status line and headers, sent once per response.
#[derive(Debug, Clone)]
pub struct Head {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Snapshot handed to finish hooks after a response ended normally.
#[derive(Debug, Clone)]
pub struct FinishedResponse {
    pub id: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Captured body, when capture was installed.
    pub body: Option<Bytes>,
    /// Set when the handler opted this response out of caching.
    pub no_cache: bool,
    pub bytes_sent: u64,
}

type FinishHook = Box<dyn FnOnce(&FinishedResponse) + Send>;

/// The writable side of one in-flight response.
pub struct ResponseWriter {
    id: String,
    status: StatusCode,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<Head>>,
    body_tx: Option<mpsc::UnboundedSender<Frame<Bytes>>>,
    flow: Arc<FlowState>,
    capture: Option<ResponseCapture>,
    on_finish: Vec<FinishHook>,
    tracker: Option<ResponseTracker>,
    allow_cookies: bool,
    no_cache: bool,
    finished: bool,
    closed: bool,
    bytes_sent: u64,
}

impl ResponseWriter {
    /// Creates a writer and the pending response it feeds.
    pub fn new(id: impl Into<String>, allow_cookies: bool) -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let flow = Arc::new(FlowState::default());
        let writer = Self {
            id: id.into(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_tx: Some(head_tx),
            body_tx: Some(body_tx),
            flow: Arc::clone(&flow),
            capture: None,
            on_finish: Vec::new(),
            tracker: None,
            allow_cookies,
            no_cache: false,
            finished: false,
            closed: false,
            bytes_sent: 0,
        };
        let pending = PendingResponse {
            head: head_rx,
            body: ChannelBody { rx: body_rx, flow },
        };
        (writer, pending)
    }

    /// Attaches the monitor guard that is finished on `end` and released on
    /// drop or client disconnect.
    pub fn with_tracker(mut self, tracker: ResponseTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether status and headers have already been sent.
    pub fn headers_sent(&self) -> bool {
        self.head_tx.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<()> {
        self.ensure_head_open()?;
        self.status = status;
        Ok(())
    }

    /// Parses and sets a header, replacing existing values.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(hyper::http::Error::from)?;
        let value = HeaderValue::from_str(value).map_err(hyper::http::Error::from)?;
        self.insert_header(name, value)
    }

    /// Sets a header, replacing existing values.
    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<()> {
        self.ensure_head_open()?;
        if self.admit(&name) {
            self.headers.insert(name, value);
        }
        Ok(())
    }

    /// Adds a header value alongside any existing ones.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<()> {
        self.ensure_head_open()?;
        if self.admit(&name) {
            self.headers.append(name, value);
        }
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<()> {
        self.ensure_head_open()?;
        self.headers.remove(name);
        Ok(())
    }

    /// Starts mirroring every written chunk. Installing twice is an error.
    pub fn install_capture(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Err(Error::CaptureAlreadyInstalled);
        }
        self.capture = Some(ResponseCapture::new());
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Opts this response out of the page cache.
    pub fn disable_cache(&mut self) {
        self.no_cache = true;
    }

    pub fn cache_disabled(&self) -> bool {
        self.no_cache
    }

    /// Registers a hook run once when the response ends normally. Hooks do
    /// not run if the response is dropped or the client disconnects.
    pub fn on_finish<F>(&mut self, hook: F)
    where
        F: FnOnce(&FinishedResponse) + Send + 'static,
    {
        self.on_finish.push(Box::new(hook));
    }

    /// Writes a chunk, sending status and headers first if needed.
    pub fn write(&mut self, chunk: impl Into<Chunk>) -> Result<()> {
        if self.finished {
            return Err(Error::ResponseFinished);
        }
        let chunk = chunk.into();
        let frame = match self.capture.as_mut() {
            Some(capture) => Frame::data(capture.record(&chunk)?),
            None => match chunk {
                Chunk::Trailers(trailers) => Frame::trailers(trailers),
                other => Frame::data(other.to_bytes()?.unwrap_or_default()),
            },
        };

        self.commit_head();
        if let Some(data) = frame.data_ref() {
            self.bytes_sent += data.len() as u64;
        }
        self.send_frame(frame);
        Ok(())
    }

    /// True while more than [`HIGH_WATER_MARK`] bytes wait on the client.
    pub fn needs_drain(&self) -> bool {
        self.flow.buffered() > HIGH_WATER_MARK
    }

    /// Waits until the client has read the backlog down to the high-water
    /// mark. Returns at once when the response is closed or ended.
    pub fn drained(&self) -> impl Future<Output = ()> + Send + 'static {
        let flow = Arc::clone(&self.flow);
        let body_tx = self.body_tx.clone();
        async move {
            loop {
                let notified = flow.drained.notified();
                let open = body_tx.as_ref().is_some_and(|tx| !tx.is_closed());
                if !open || flow.buffered() <= HIGH_WATER_MARK {
                    return;
                }
                notified.await;
            }
        }
    }

    /// Writes a chunk, then waits for the client if the backlog is too big.
    pub async fn write_paced(&mut self, chunk: impl Into<Chunk>) -> Result<()> {
        self.write(chunk)?;
        if self.needs_drain() {
            self.drained().await;
        }
        Ok(())
    }

    /// Sends a redirect to `location` and ends the response.
    pub fn redirect(&mut self, status: StatusCode, location: &str) -> Result<()> {
        let value = HeaderValue::from_str(location).map_err(hyper::http::Error::from)?;
        self.set_status(status)?;
        self.insert_header(LOCATION, value)?;
        self.end()
    }

    /// Writes a final chunk and ends the response.
    pub fn end_with(&mut self, chunk: impl Into<Chunk>) -> Result<()> {
        self.write(chunk)?;
        self.end()
    }

    /// Ends the response, running finish hooks and signalling the monitor.
    pub fn end(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::ResponseFinished);
        }
        self.commit_head();
        self.finished = true;
        self.body_tx = None;

        if self.closed {
            self.on_finish.clear();
            return Ok(());
        }

        let finished = FinishedResponse {
            id: self.id.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.capture.take().map(ResponseCapture::into_bytes),
            no_cache: self.no_cache,
            bytes_sent: self.bytes_sent,
        };
        for hook in self.on_finish.drain(..) {
            hook(&finished);
        }
        if let Some(tracker) = self.tracker.take() {
            tracker.finish();
        }
        Ok(())
    }

    fn ensure_head_open(&self) -> Result<()> {
        if self.headers_sent() {
            Err(Error::HeadersSent)
        } else {
            Ok(())
        }
    }

    fn admit(&self, name: &HeaderName) -> bool {
        if *name == SET_COOKIE && !self.allow_cookies {
            warn!(
                "Discarding Set-Cookie on response {}: cookies are not allowed",
                self.id
            );
            return false;
        }
        true
    }

    fn commit_head(&mut self) {
        if let Some(tx) = self.head_tx.take() {
            let head = Head {
                status: self.status,
                headers: self.headers.clone(),
            };
            if tx.send(head).is_err() {
                self.close();
            }
        }
    }

    fn send_frame(&mut self, frame: Frame<Bytes>) {
        if let Some(tx) = &self.body_tx {
            let len = frame.data_ref().map_or(0, |data| data.len() as u64);
            self.flow.buffered.fetch_add(len, Ordering::AcqRel);
            if tx.send(frame).is_err() {
                self.close();
            }
        }
    }

    /// Client went away: stop sending and release the monitor entry.
    fn close(&mut self) {
        if !self.closed {
            debug!("Response {} closed by client", self.id);
            self.closed = true;
            self.body_tx = None;
            self.tracker = None;
        }
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Response {} dropped before it was ended", self.id);
        }
    }
}

/// The readable side of a [`ResponseWriter`].
pub struct PendingResponse {
    head: oneshot::Receiver<Head>,
    body: ChannelBody,
}

impl PendingResponse {
    /// Waits for the head and returns a response whose body streams the
    /// writer's frames. A writer dropped before sending anything yields a 500.
    pub async fn into_response(self) -> Response<ResponseBody> {
        match self.head.await {
            Ok(head) => {
                let mut resp = Response::new(self.body.boxed());
                *resp.status_mut() = head.status;
                *resp.headers_mut() = head.headers;
                resp
            }
            Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        }
    }

    /// Waits for the whole response and returns its head and body bytes.
    pub async fn collect(self) -> (Head, Bytes) {
        let resp = self.into_response().await;
        let (parts, body) = resp.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };
        (
            Head {
                status: parts.status,
                headers: parts.headers,
            },
            bytes,
        )
    }
}

struct ChannelBody {
    rx: mpsc::UnboundedReceiver<Frame<Bytes>>,
    flow: Arc<FlowState>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(frame)) = &polled {
            let len = frame.data_ref().map_or(0, |data| data.len() as u64);
            let left = self.flow.buffered.fetch_sub(len, Ordering::AcqRel) - len;
            if left <= HIGH_WATER_MARK {
                self.flow.drained.notify_waiters();
            }
        }
        polled.map(|frame| frame.map(Ok))
    }
}

impl Drop for ChannelBody {
    fn drop(&mut self) {
        self.rx.close();
        self.flow.drained.notify_waiters();
    }
}
