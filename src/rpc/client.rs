//! Persistent JSON-RPC client for the Moonraker Unix socket.
//!
//! [`MoonrakerClient`] owns one connection lifetime. Its background task
//! dials the socket with indefinite retry, performs the mandatory identify
//! handshake, then lets a read loop feed decoded frames to the router while
//! callers issue concurrent requests. Disconnection is fatal: once the
//! connection tears down the client stays `Disconnected`, every pending
//! call fails with [`RpcError::ConnectionClosed`], and the owner is expected
//! to exit so a supervisor restarts the process with clean session state.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Connecting -> Identifying -> Ready -> Disconnected
//! ```
//!
//! - `connect()` - spawn the lifecycle task, returns immediately
//! - `wait_ready()` - suspend until the handshake completes
//! - `call()` - send a request and wait for its matching response
//! - `subscribe()` - receive server-pushed notifications
//! - `closed()` - observe teardown

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::rpc::framing::{self, FrameError, FrameReader};
use crate::rpc::protocol::{ClientIdentity, RpcRequest, IDENTIFY_METHOD};
use crate::rpc::router::Router;

/// Fixed backoff between dial attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive decode failures tolerated before the connection is torn
/// down. A single valid frame resets the budget.
const DECODE_ERROR_BUDGET: u32 = 10;

/// RPC-specific error types.
///
/// Transport-level errors never cross this boundary: dial failures are
/// retried internally and everything fatal collapses into
/// [`RpcError::ConnectionClosed`], which is kept distinguishable from
/// [`RpcError::Timeout`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// The connection tore down before (or while) the call completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// An explicit per-call deadline elapsed.
    ///
    /// Only produced by [`MoonrakerClient::call_with_timeout`]; plain
    /// [`MoonrakerClient::call`] waits until resolution or teardown.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Caller input rejected before any request was built or sent.
    #[error("invalid request parameters: {0}")]
    InvalidParams(String),

    /// Protocol-level error (serialization, response shape).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with a JSON-RPC error object.
    #[error("server error {code}: {message}")]
    Server {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<Value>,
    },
}

/// Lifecycle state of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing the socket (retried indefinitely).
    Connecting,
    /// Socket open, identify handshake in flight.
    Identifying,
    /// Handshake complete; callers may issue requests.
    Ready,
    /// Torn down. Terminal: the client never reconnects.
    Disconnected,
}

struct Shared {
    router: Router,
    /// Write half, present from successful dial until teardown. Held behind
    /// an async mutex because writes await while holding it; this also
    /// serializes concurrent senders so frames never interleave.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Monotonically increasing request id counter, scoped to this
    /// connection's lifetime so identifiers are never reused while pending.
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move the state machine forward. `Disconnected` is terminal: once
    /// entered no transition leaves it. Returns whether the state changed.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Disconnected || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    async fn write(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => framing::write_frame(writer, frame).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "socket not connected",
            )),
        }
    }

    /// Send one request and wait for its matching response.
    ///
    /// Does not gate on readiness; `call` applies the gate and the identify
    /// handshake is the only direct caller before `Ready`.
    async fn send_request(self: &Arc<Self>, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);
        let frame = framing::encode_request(&request)
            .map_err(|e| RpcError::Protocol(format!("failed to serialize request: {}", e)))?;

        // Register before writing so a response cannot race the insert.
        let completion = self.router.register_pending(id);

        if let Err(e) = self.write(&frame).await {
            self.router.discard_pending(id);
            warn!(method, error = %e, "write failed, tearing down connection");
            self.teardown().await;
            return Err(RpcError::ConnectionClosed);
        }
        trace!(method, id, "request sent");

        match completion.await {
            Ok(response) => process_response(response),
            // Sender dropped by teardown.
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Tear the connection down: park the state machine in `Disconnected`,
    /// fail every pending call, end every notification stream, and close
    /// the socket. Idempotent; later calls are no-ops.
    async fn teardown(&self) {
        if !self.transition(ConnectionState::Disconnected) {
            return;
        }
        info!("Moonraker connection torn down");
        self.router.close();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Shutdown trigger owned by the client handles.
///
/// The lifecycle task only holds `Shared`, so once every clone of
/// [`MoonrakerClient`] is gone this drop fires, parks the state machine in
/// `Disconnected`, and the dial/read tasks observe that and exit instead of
/// retrying forever for an owner that no longer exists.
struct HandleGuard {
    shared: Arc<Shared>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.shared.transition(ConnectionState::Disconnected) {
            debug!("all client handles dropped, shutting down connection");
            self.shared.router.close();
        }
    }
}

/// Async client for Moonraker's JSON-RPC Unix socket.
///
/// Cheap to clone; all clones share one connection. Requests issued
/// concurrently are matched to responses strictly by identifier, so a later
/// call may legitimately resolve before an earlier one. Dropping the last
/// clone shuts the connection down.
#[derive(Clone)]
pub struct MoonrakerClient {
    shared: Arc<Shared>,
    guard: Arc<HandleGuard>,
}

impl MoonrakerClient {
    /// Spawn the connection lifecycle and return a handle to it.
    ///
    /// Dialing retries at a fixed 1s interval until it succeeds or the last
    /// handle is dropped, so transient failures (daemon not yet up) never
    /// surface. The identify handshake runs before the connection becomes
    /// [`ConnectionState::Ready`]; use [`wait_ready`](Self::wait_ready) to
    /// observe the outcome.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(socket_path: impl Into<PathBuf>, identity: ClientIdentity) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            router: Router::default(),
            writer: Mutex::new(None),
            next_id: AtomicU64::new(1),
            state,
        });
        tokio::spawn(run_connection(shared.clone(), socket_path.into(), identity));
        Self {
            shared: shared.clone(),
            guard: Arc::new(HandleGuard { shared }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    /// Whether the connection is ready for requests.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Suspend until the connection is ready.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] if the connection tears down
    /// first (including identify-handshake failure).
    pub async fn wait_ready(&self) -> Result<(), RpcError> {
        let mut state = self.shared.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Disconnected => return Err(RpcError::ConnectionClosed),
                ConnectionState::Connecting | ConnectionState::Identifying => {}
            }
            if state.changed().await.is_err() {
                return Err(RpcError::ConnectionClosed);
            }
        }
    }

    /// Suspend until the connection has torn down.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        while *state.borrow_and_update() != ConnectionState::Disconnected {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Suspends while the connection is still identifying; a call issued
    /// before the handshake completes waits rather than failing. There is
    /// no implicit deadline - a request the server silently drops suspends
    /// until teardown (see [`call_with_timeout`](Self::call_with_timeout)).
    ///
    /// # Errors
    ///
    /// - [`RpcError::InvalidParams`] if `params` is neither an object nor null
    /// - [`RpcError::Server`] if the server answers with an error object
    /// - [`RpcError::ConnectionClosed`] if the connection tears down
    ///
    /// # Example
    ///
    /// ```ignore
    /// let status = client
    ///     .call("printer.objects.query", json!({"objects": {"print_stats": null}}))
    ///     .await?;
    /// ```
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if !(params.is_object() || params.is_null()) {
            return Err(RpcError::InvalidParams(format!(
                "params must be a JSON object, got {}",
                json_type_name(&params)
            )));
        }
        self.wait_ready().await?;
        self.shared.send_request(method, params).await
    }

    /// [`call`](Self::call) with an explicit deadline.
    ///
    /// On expiry the pending completion is abandoned; a response that
    /// arrives later is matched by the router and quietly dropped, so it is
    /// never misdelivered to an unrelated call.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus [`RpcError::Timeout`] on expiry.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, RpcError> {
        match timeout(deadline, self.call(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(deadline)),
        }
    }

    /// Register a notification listener.
    ///
    /// The stream yields every server-pushed notification frame, in decode
    /// order, until the connection tears down. Dropping the stream
    /// deregisters the listener.
    pub fn subscribe(&self) -> NotificationStream {
        let (listener_id, queue) = self.shared.router.register_listener();
        NotificationStream {
            listener_id,
            queue,
            shared: self.shared.clone(),
        }
    }
}

/// Stream of raw notification frames for one registered listener.
pub struct NotificationStream {
    listener_id: u64,
    queue: mpsc::UnboundedReceiver<Value>,
    shared: Arc<Shared>,
}

impl NotificationStream {
    /// Receive the next notification, or `None` once the connection has
    /// torn down.
    pub async fn recv(&mut self) -> Option<Value> {
        self.queue.recv().await
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.shared.router.deregister_listener(self.listener_id);
    }
}

/// Connection lifecycle: dial with retry, handshake, then hand the stream
/// to the read loop until teardown.
async fn run_connection(shared: Arc<Shared>, socket_path: PathBuf, identity: ClientIdentity) {
    info!(path = %socket_path.display(), "connecting to Moonraker");
    let mut shutdown = shared.state.subscribe();
    let stream = loop {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => break stream,
            Err(e) => {
                debug!(error = %e, "dial failed, retrying in {:?}", RETRY_INTERVAL);
                tokio::select! {
                    _ = sleep(RETRY_INTERVAL) => {}
                    _ = shutdown.wait_for(|s| *s == ConnectionState::Disconnected) => return,
                }
            }
        }
    };

    // False only if the handles were dropped while dialing.
    if !shared.transition(ConnectionState::Identifying) {
        return;
    }
    let (read_half, write_half) = stream.into_split();
    *shared.writer.lock().await = Some(write_half);
    tokio::spawn(read_loop(shared.clone(), FrameReader::new(read_half)));

    // Mandatory handshake: no external call proceeds until this resolves.
    match shared
        .send_request(IDENTIFY_METHOD, identity.to_params())
        .await
    {
        Ok(result) => {
            info!("client identified with Moonraker: {}", result);
            shared.transition(ConnectionState::Ready);
        }
        Err(e) => {
            warn!(error = %e, "identify handshake failed");
            shared.teardown().await;
        }
    }
}

/// Decode frames until the stream ends, the decode-error budget runs out,
/// or the state machine is parked elsewhere, then tear the connection down.
async fn read_loop(shared: Arc<Shared>, mut reader: FrameReader) {
    let mut errors_remaining = DECODE_ERROR_BUDGET;
    let mut shutdown = shared.state.subscribe();
    loop {
        let result = tokio::select! {
            result = reader.read_frame() => result,
            _ = shutdown.wait_for(|s| *s == ConnectionState::Disconnected) => break,
        };
        match result {
            Ok(frame) => {
                errors_remaining = DECODE_ERROR_BUDGET;
                shared.router.route(frame);
            }
            Err(FrameError::Malformed(reason)) => {
                warn!(%reason, errors_remaining, "skipping undecodable frame");
                if errors_remaining == 0 {
                    break;
                }
                errors_remaining -= 1;
            }
            Err(FrameError::Closed) => {
                info!("Moonraker closed the connection");
                break;
            }
            Err(FrameError::Io(e)) => {
                warn!(error = %e, "socket read failed");
                break;
            }
        }
    }
    shared.teardown().await;
}

/// Extract the result from a response frame, or surface its error object.
fn process_response(frame: Value) -> Result<Value, RpcError> {
    let mut frame = match frame {
        Value::Object(map) => map,
        other => {
            return Err(RpcError::Protocol(format!(
                "response is not a JSON object: {}",
                other
            )))
        }
    };

    if let Some(error) = frame.remove("error") {
        return Err(RpcError::Server {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown server error")
                .to_string(),
            data: error.get("data").cloned(),
        });
    }

    frame
        .remove("result")
        .ok_or_else(|| RpcError::Protocol("response missing both result and error".to_string()))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
