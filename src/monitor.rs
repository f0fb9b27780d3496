//! In-flight response tracking.
//!
//! A container may only report an invocation complete once every response
//! and every side effect gated on one (cache writes, metrics) has finished.
//! The monitor keeps the set of pending ids and hands out a single shared
//! future that resolves the moment that set becomes empty.

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type DrainFuture = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct PendingResponses {
    ids: Vec<String>,
    promise: Option<DrainFuture>,
    resolve: Option<oneshot::Sender<()>>,
}

/// Tracks in-flight responses by id.
#[derive(Default)]
pub struct RequestMonitor {
    pending: Mutex<PendingResponses>,
}

impl RequestMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` as in flight.
    pub fn response_started(&self, id: &str) {
        let mut pending = self.pending.lock();
        pending.ids.push(id.to_string());
        trace!("Response started: {} ({} pending)", id, pending.ids.len());
    }

    /// Removes every occurrence of `id`. Resolves the shared future once
    /// nothing is pending. Safe to call repeatedly for the same id.
    pub fn response_finished(&self, id: &str) {
        let mut pending = self.pending.lock();
        pending.ids.retain(|pending_id| pending_id != id);
        trace!("Response finished: {} ({} pending)", id, pending.ids.len());

        if pending.ids.is_empty() {
            if let Some(resolve) = pending.resolve.take() {
                debug!("All pending responses finished");
                let _ = resolve.send(());
            }
            pending.promise = None;
        }
    }

    /// Resolves once no response is pending.
    ///
    /// The returned future checks the live set at finish time, so responses
    /// that start after this call are waited for too.
    pub fn wait_for_responses(&self) -> BoxFuture<'static, ()> {
        let mut pending = self.pending.lock();
        if pending.ids.is_empty() {
            return future::ready(()).boxed();
        }

        if let Some(promise) = &pending.promise {
            return promise.clone().boxed();
        }

        let (tx, rx) = oneshot::channel::<()>();
        let promise = rx.map(|_| ()).boxed().shared();
        pending.promise = Some(promise.clone());
        pending.resolve = Some(tx);
        promise.boxed()
    }

    /// Number of pending entries, duplicates included.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().ids.len()
    }

    /// Starts tracking `id` and returns a guard that finishes it.
    ///
    /// The guard finishes the id when [`ResponseTracker::finish`] is called
    /// (normal completion) or when it is dropped (abnormal close), whichever
    /// happens first.
    pub fn track(self: &Arc<Self>, id: impl Into<String>) -> ResponseTracker {
        let id = id.into();
        self.response_started(&id);
        ResponseTracker {
            monitor: Arc::clone(self),
            id,
            done: false,
        }
    }
}

/// Completion hooks for one tracked id.
pub struct ResponseTracker {
    monitor: Arc<RequestMonitor>,
    id: String,
    done: bool,
}

impl ResponseTracker {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signals normal completion.
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if !self.done {
            self.done = true;
            self.monitor.response_finished(&self.id);
        }
    }
}

impl Drop for ResponseTracker {
    fn drop(&mut self) {
        if !self.done {
            trace!("Response {} closed without finishing", self.id);
        }
        self.complete();
    }
}
