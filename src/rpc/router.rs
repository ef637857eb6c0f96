//! Inbound frame classification and notification fan-out.
//!
//! Every decoded frame passes through [`Router::route`]: a frame whose `id`
//! matches a live pending completion resolves that call, and everything
//! else - frames with no `id`, or frames carrying a stale `id` with no
//! matching entry - is a notification delivered to every registered
//! listener. Delivery goes through unbounded per-listener queues, so a slow
//! consumer never stalls the read loop and each listener observes frames in
//! decode order.
//!
//! [`Router::close`] is a one-way door: registrations that arrive after it
//! (a caller that raced teardown) get an already-failed completion or an
//! already-ended stream, so nothing suspends forever on a dead connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Lock a map, recovering the guard if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot completions per outstanding request identifier.
#[derive(Debug, Default)]
struct PendingTable {
    calls: HashMap<u64, oneshot::Sender<Value>>,
    closed: bool,
}

/// Registered notification listeners, keyed by listener handle.
#[derive(Debug, Default)]
struct ListenerTable {
    queues: HashMap<u64, mpsc::UnboundedSender<Value>>,
    closed: bool,
}

/// Correlates responses with pending calls and fans out notifications.
#[derive(Debug, Default)]
pub(crate) struct Router {
    pending: Mutex<PendingTable>,
    listeners: Mutex<ListenerTable>,
    next_listener_id: AtomicU64,
}

impl Router {
    /// Record a pending completion for `id` and return its receiver.
    ///
    /// The identifier counter guarantees at most one live entry per id. On
    /// a closed router the receiver fails immediately instead of being
    /// recorded, so a registration racing teardown cannot outlive it.
    pub(crate) fn register_pending(&self, id: u64) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.pending);
        if !pending.closed {
            let previous = pending.calls.insert(id, tx);
            debug_assert!(previous.is_none(), "duplicate pending request id {id}");
        }
        rx
    }

    /// Drop a pending completion that was never sent (e.g. write failure).
    pub(crate) fn discard_pending(&self, id: u64) {
        lock(&self.pending).calls.remove(&id);
    }

    /// Register a notification listener, returning its handle and queue.
    ///
    /// On a closed router the queue is already ended.
    pub(crate) fn register_listener(&self) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = lock(&self.listeners);
        if !listeners.closed {
            listeners.queues.insert(id, tx);
        }
        (id, rx)
    }

    /// Remove a listener. A handle that was already removed is a no-op.
    pub(crate) fn deregister_listener(&self, id: u64) {
        lock(&self.listeners).queues.remove(&id);
    }

    /// Classify and deliver one inbound frame.
    pub(crate) fn route(&self, frame: Value) {
        if let Some(id) = super::protocol::frame_id(&frame) {
            if let Some(completion) = lock(&self.pending).calls.remove(&id) {
                if completion.send(frame).is_err() {
                    // Caller stopped waiting (per-call timeout); drop the body.
                    debug!(id, "response arrived for an abandoned call");
                }
                return;
            }
            // Stale id with no matching pending entry: not an error, the
            // frame is reclassified as a notification.
            trace!(id, "unmatched response id, routing to listeners");
        }
        self.dispatch(frame);
    }

    /// Deliver a notification to every registered listener.
    fn dispatch(&self, frame: Value) {
        // Best effort: a listener dropped mid-dispatch is pruned, not an error.
        lock(&self.listeners)
            .queues
            .retain(|_, queue| queue.send(frame.clone()).is_ok());
    }

    /// Tear down: fail every pending completion with "connection closed"
    /// (their senders drop, so each receiver errors exactly once), end
    /// every notification stream, and refuse later registrations.
    pub(crate) fn close(&self) {
        let outstanding = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            pending.calls.drain().count()
        };
        if outstanding > 0 {
            debug!(outstanding, "failing pending requests: connection closed");
        }
        let mut listeners = lock(&self.listeners);
        listeners.closed = true;
        listeners.queues.clear();
    }
}
