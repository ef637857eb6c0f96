//! Behaviour tests for the Moonraker RPC connection core.
//!
//! Each test binds an in-process Unix socket, connects the client to it,
//! and drives scripted responses from the server side. No external daemon
//! is required, so these tests always run.

use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{sleep, timeout};

use moonbridge::rpc::{
    ClientIdentity, ConnectionState, MoonrakerClient, RpcError, FRAME_TERMINATOR, IDENTIFY_METHOD,
};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Generate a unique socket path for this test to avoid conflicts.
fn test_socket_path(test_name: &str) -> PathBuf {
    let pid = std::process::id();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    PathBuf::from(format!(
        "/tmp/moonbridge-test-{}-{}-{}.sock",
        test_name, pid, timestamp
    ))
}

/// Clean up socket file after test.
fn cleanup_socket(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
}

/// Scripted stand-in for the Moonraker daemon: one accepted connection plus
/// a frame buffer.
struct TestServer {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl TestServer {
    async fn accept(listener: &UnixListener) -> Self {
        let (stream, _) = timeout(TEST_TIMEOUT, listener.accept())
            .await
            .expect("Test timed out waiting for client")
            .expect("Accept failed");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Read one terminated frame from the client.
    async fn read_frame(&mut self) -> Value {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == FRAME_TERMINATOR) {
                let frame: Vec<u8> = self.buf.drain(..=pos).collect();
                return serde_json::from_slice(&frame[..frame.len() - 1])
                    .expect("client sent invalid JSON frame");
            }
            let mut chunk = [0u8; 4096];
            let n = timeout(TEST_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("Test timed out waiting for a frame")
                .expect("Read failed");
            assert!(n > 0, "client closed while a frame was expected");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Write failed");
        self.stream.flush().await.expect("Flush failed");
    }

    async fn send_frame(&mut self, document: &Value) {
        let mut bytes = serde_json::to_vec(document).expect("serialize frame");
        bytes.push(FRAME_TERMINATOR);
        self.send_raw(&bytes).await;
    }

    /// Consume the identify request and acknowledge it. Returns the request
    /// so tests can inspect the payload.
    async fn handle_identify(&mut self) -> Value {
        let request = self.read_frame().await;
        assert_eq!(request["method"], IDENTIFY_METHOD);
        self.send_frame(&json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {"connection_id": 1}
        }))
        .await;
        request
    }
}

/// Bind a listener, connect a client through the full handshake, and return
/// both ends ready for scripting.
async fn connect_ready(test_name: &str) -> (MoonrakerClient, TestServer, PathBuf) {
    let path = test_socket_path(test_name);
    let listener = UnixListener::bind(&path).expect("bind test socket");
    let client = MoonrakerClient::connect(&path, ClientIdentity::default());
    let mut server = TestServer::accept(&listener).await;
    server.handle_identify().await;
    timeout(TEST_TIMEOUT, client.wait_ready())
        .await
        .expect("Test timed out waiting for ready")
        .expect("Handshake should succeed");
    (client, server, path)
}

/// Test: the identify handshake is sent exactly once per connection, first,
/// with the four-field payload.
#[tokio::test]
async fn test_identify_payload_shape() {
    let path = test_socket_path("identify_payload");
    let listener = UnixListener::bind(&path).expect("bind test socket");
    let client = MoonrakerClient::connect(&path, ClientIdentity::default());

    let mut server = TestServer::accept(&listener).await;
    let request = server.handle_identify().await;

    assert_eq!(request["jsonrpc"], "2.0");
    assert!(request["id"].is_u64());
    for field in ["client_name", "version", "type", "url"] {
        assert!(
            request["params"][field].is_string(),
            "identify payload missing string field {}",
            field
        );
    }

    timeout(TEST_TIMEOUT, client.wait_ready())
        .await
        .expect("Test timed out")
        .expect("Handshake should succeed");
    assert!(client.is_ready());
    cleanup_socket(&path);
}

/// Test: no external call completes before the identify call has itself
/// completed on the connection.
#[tokio::test]
async fn test_handshake_gates_external_calls() {
    let path = test_socket_path("handshake_gating");
    let listener = UnixListener::bind(&path).expect("bind test socket");
    let client = MoonrakerClient::connect(&path, ClientIdentity::default());

    let mut server = TestServer::accept(&listener).await;
    let identify = server.read_frame().await;
    assert_eq!(identify["method"], IDENTIFY_METHOD);

    // Call issued while the handshake is still in flight: it must wait.
    let early_caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("server.info", json!({})).await })
    };
    sleep(Duration::from_millis(100)).await;
    assert!(!early_caller.is_finished(), "call completed before identify");
    assert!(!client.is_ready());
    assert_eq!(client.state(), ConnectionState::Identifying);

    // Acknowledge the handshake; the gated call now reaches the wire.
    server
        .send_frame(&json!({"jsonrpc": "2.0", "id": identify["id"], "result": {}}))
        .await;
    let request = server.read_frame().await;
    assert_eq!(request["method"], "server.info");
    server
        .send_frame(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {"klippy_state": "ready"}}))
        .await;

    let result = timeout(TEST_TIMEOUT, early_caller)
        .await
        .expect("Test timed out")
        .expect("task join")
        .expect("gated call should succeed");
    assert_eq!(result, json!({"klippy_state": "ready"}));
    cleanup_socket(&path);
}

/// Test: an identify failure is a connection-level failure, not a retry.
#[tokio::test]
async fn test_handshake_failure_tears_down() {
    let path = test_socket_path("handshake_failure");
    let listener = UnixListener::bind(&path).expect("bind test socket");
    let client = MoonrakerClient::connect(&path, ClientIdentity::default());

    let mut server = TestServer::accept(&listener).await;
    let identify = server.read_frame().await;
    server
        .send_frame(&json!({
            "jsonrpc": "2.0",
            "id": identify["id"],
            "error": {"code": -32602, "message": "Invalid identification"}
        }))
        .await;

    let ready = timeout(TEST_TIMEOUT, client.wait_ready())
        .await
        .expect("Test timed out");
    assert!(matches!(ready, Err(RpcError::ConnectionClosed)));
    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("Test timed out waiting for teardown");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    cleanup_socket(&path);
}

/// Test: concurrently issued calls resolve by identifier even when the
/// responses arrive in a different order than the requests were sent.
#[tokio::test]
async fn test_correlation_out_of_order_responses() {
    let (client, mut server, path) = connect_ready("out_of_order").await;

    let methods = ["printer.info", "server.info", "machine.system_info"];
    let callers: Vec<_> = methods
        .iter()
        .map(|method| {
            let client = client.clone();
            let method = method.to_string();
            tokio::spawn(async move { client.call(&method, json!({})).await })
        })
        .collect();

    // Collect all three requests, then answer them in reverse order, each
    // response echoing the method of the request it belongs to.
    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(server.read_frame().await);
    }
    for request in requests.iter().rev() {
        server
            .send_frame(&json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"answered": request["method"]}
            }))
            .await;
    }

    for (caller, method) in callers.into_iter().zip(methods) {
        let result = timeout(TEST_TIMEOUT, caller)
            .await
            .expect("Test timed out")
            .expect("task join")
            .expect("call should succeed");
        assert_eq!(result, json!({"answered": method}));
    }
    cleanup_socket(&path);
}

/// Test: frames with no id always reach listeners, never the correlator.
#[tokio::test]
async fn test_notifications_fan_out_to_all_listeners() {
    let (client, mut server, path) = connect_ready("notification_fanout").await;

    let mut first = client.subscribe();
    let mut second = client.subscribe();

    let notification = json!({
        "jsonrpc": "2.0",
        "method": "notify_klippy_ready",
        "params": []
    });
    server.send_frame(&notification).await;

    let got_first = timeout(TEST_TIMEOUT, first.recv())
        .await
        .expect("Test timed out")
        .expect("first listener should receive");
    let got_second = timeout(TEST_TIMEOUT, second.recv())
        .await
        .expect("Test timed out")
        .expect("second listener should receive");
    assert_eq!(got_first, notification);
    assert_eq!(got_second, notification);
    cleanup_socket(&path);
}

/// Test: an id that matches no pending request is reclassified as a
/// notification, not treated as an error, and the connection stays usable.
#[tokio::test]
async fn test_stale_id_routed_to_listeners() {
    let (client, mut server, path) = connect_ready("stale_id").await;

    let mut listener = client.subscribe();
    let stale = json!({"jsonrpc": "2.0", "id": 424242, "result": {"late": true}});
    server.send_frame(&stale).await;

    let delivered = timeout(TEST_TIMEOUT, listener.recv())
        .await
        .expect("Test timed out")
        .expect("stale frame should reach listeners");
    assert_eq!(delivered, stale);

    // The connection is unaffected: a normal call still round-trips.
    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("server.info", json!({})).await })
    };
    let request = server.read_frame().await;
    server
        .send_frame(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
        .await;
    timeout(TEST_TIMEOUT, caller)
        .await
        .expect("Test timed out")
        .expect("task join")
        .expect("call should succeed");
    cleanup_socket(&path);
}

/// Test: ten consecutive malformed frames are tolerated and a valid frame
/// resets the budget; the connection survives two such bursts.
#[tokio::test]
async fn test_decode_error_budget_tolerates_ten_and_resets() {
    let (client, mut server, path) = connect_ready("error_budget_reset").await;

    let mut listener = client.subscribe();
    let heartbeat = json!({"jsonrpc": "2.0", "method": "notify_klippy_ready", "params": []});

    for _ in 0..2 {
        for _ in 0..10 {
            server.send_raw(b"!!not json!!\x03").await;
        }
        server.send_frame(&heartbeat).await;
        let delivered = timeout(TEST_TIMEOUT, listener.recv())
            .await
            .expect("Test timed out")
            .expect("connection should survive ten bad frames");
        assert_eq!(delivered, heartbeat);
    }
    assert!(client.is_ready());
    cleanup_socket(&path);
}

/// Test: the eleventh consecutive malformed frame tears the connection
/// down and fails the outstanding call with connection-closed.
#[tokio::test]
async fn test_eleventh_decode_failure_tears_down() {
    let (client, mut server, path) = connect_ready("error_budget_exhausted").await;

    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("server.info", json!({})).await })
    };
    // Leave the request pending so teardown has something to fail.
    let _request = server.read_frame().await;

    for _ in 0..11 {
        server.send_raw(b"!!not json!!\x03").await;
    }

    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("Test timed out waiting for teardown");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let result = timeout(TEST_TIMEOUT, caller)
        .await
        .expect("Test timed out")
        .expect("task join");
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    cleanup_socket(&path);
}

/// Test: clean end-of-stream fails every pending call with
/// connection-closed exactly once and parks the client in Disconnected.
#[tokio::test]
async fn test_eof_fails_all_pending_calls() {
    let (client, mut server, path) = connect_ready("eof_teardown").await;

    let callers: Vec<_> = (0..3)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { client.call(&format!("query.{}", n), json!({})).await })
        })
        .collect();
    for _ in 0..3 {
        let _ = server.read_frame().await;
    }

    drop(server);

    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("Test timed out waiting for teardown");
    for caller in callers {
        let result = timeout(TEST_TIMEOUT, caller)
            .await
            .expect("Test timed out")
            .expect("task join");
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }

    // Later calls fail fast; nothing is left to wait for.
    let late = timeout(TEST_TIMEOUT, client.call("server.info", json!({})))
        .await
        .expect("Test timed out");
    assert!(matches!(late, Err(RpcError::ConnectionClosed)));
    assert!(!client.is_ready());
    cleanup_socket(&path);
}

/// Test: notification streams end on teardown.
#[tokio::test]
async fn test_notification_stream_ends_on_teardown() {
    let (client, server, path) = connect_ready("stream_ends").await;

    let mut listener = client.subscribe();
    drop(server);

    let next = timeout(TEST_TIMEOUT, listener.recv())
        .await
        .expect("Test timed out");
    assert_eq!(next, None);
    drop(client);
    cleanup_socket(&path);
}

/// Scenario from the wire contract: a print_stats query round-trips with
/// the canonical request form and resolves to the server's result object.
#[tokio::test]
async fn test_scenario_print_stats_query() {
    let (client, mut server, path) = connect_ready("print_stats").await;

    let caller = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call(
                    "printer.objects.query",
                    json!({"objects": {"print_stats": null}}),
                )
                .await
        })
    };

    let request = server.read_frame().await;
    assert_eq!(request["jsonrpc"], "2.0");
    assert_eq!(request["method"], "printer.objects.query");
    assert_eq!(request["params"], json!({"objects": {"print_stats": null}}));
    assert!(request["id"].is_u64());

    server
        .send_frame(&json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {"status": {"print_stats": {"state": "printing"}}}
        }))
        .await;

    let result = timeout(TEST_TIMEOUT, caller)
        .await
        .expect("Test timed out")
        .expect("task join")
        .expect("call should succeed");
    assert_eq!(
        result,
        json!({"status": {"print_stats": {"state": "printing"}}})
    );
    cleanup_socket(&path);
}

/// Test: empty params are omitted from the wire form entirely.
#[tokio::test]
async fn test_empty_params_omitted_on_wire() {
    let (client, mut server, path) = connect_ready("params_omitted").await;

    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("server.info", json!({})).await })
    };
    let request = server.read_frame().await;
    assert!(request.get("params").is_none());

    server
        .send_frame(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
        .await;
    timeout(TEST_TIMEOUT, caller)
        .await
        .expect("Test timed out")
        .expect("task join")
        .expect("call should succeed");
    cleanup_socket(&path);
}

/// Test: a JSON-RPC error response surfaces as a server error, with code
/// and message intact.
#[tokio::test]
async fn test_server_error_response() {
    let (client, mut server, path) = connect_ready("server_error").await;

    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("printer.gcode.script", json!({})).await })
    };
    let request = server.read_frame().await;
    server
        .send_frame(&json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32000, "message": "Klippy host not connected"}
        }))
        .await;

    let result = timeout(TEST_TIMEOUT, caller)
        .await
        .expect("Test timed out")
        .expect("task join");
    match result {
        Err(RpcError::Server { code, message, .. }) => {
            assert_eq!(code, -32000);
            assert_eq!(message, "Klippy host not connected");
        }
        other => panic!("Expected Server error, got {:?}", other),
    }
    cleanup_socket(&path);
}

/// Test: the explicit timeout extension is distinguishable from
/// connection-closed, and an abandoned call's late response is dropped
/// without disturbing later calls.
#[tokio::test]
async fn test_call_timeout_distinct_and_late_response_dropped() {
    let (client, mut server, path) = connect_ready("call_timeout").await;

    let result = client
        .call_with_timeout("server.info", json!({}), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(RpcError::Timeout(_))));
    assert!(client.is_ready(), "timeout must not tear the connection down");

    // The server answers late; the router drops the abandoned response.
    let request = server.read_frame().await;
    server
        .send_frame(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {"late": true}}))
        .await;

    // A fresh call is unaffected by the dropped body.
    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.call("printer.info", json!({})).await })
    };
    let request = server.read_frame().await;
    assert_eq!(request["method"], "printer.info");
    server
        .send_frame(&json!({"jsonrpc": "2.0", "id": request["id"], "result": {"fresh": true}}))
        .await;
    let result = timeout(TEST_TIMEOUT, caller)
        .await
        .expect("Test timed out")
        .expect("task join")
        .expect("call should succeed");
    assert_eq!(result, json!({"fresh": true}));
    cleanup_socket(&path);
}

/// Test: a single listener observes notifications in frame-decode order
/// even when malformed frames are interleaved.
#[tokio::test]
async fn test_listener_order_preserved_across_bad_frames() {
    let (client, mut server, path) = connect_ready("listener_order").await;

    let mut listener = client.subscribe();
    for seq in 0..5 {
        server
            .send_frame(&json!({"jsonrpc": "2.0", "method": "notify_status_update", "params": [seq]}))
            .await;
        server.send_raw(b"garbage\x03").await;
    }

    for seq in 0..5 {
        let frame = timeout(TEST_TIMEOUT, listener.recv())
            .await
            .expect("Test timed out")
            .expect("notification delivered");
        assert_eq!(frame["params"][0], json!(seq));
    }
    drop(client);
    cleanup_socket(&path);
}

/// Test: dropping every client handle while still dialing shuts the
/// lifecycle down instead of leaving a retry loop behind.
#[tokio::test]
async fn test_drop_while_dialing_shuts_down() {
    let path = test_socket_path("drop_while_dialing");
    let client = MoonrakerClient::connect(&path, ClientIdentity::default());
    let mut notifications = client.subscribe();
    assert_eq!(client.state(), ConnectionState::Connecting);

    drop(client);

    // Shutdown ends the stream; nothing is dialing on our behalf anymore.
    let next = timeout(TEST_TIMEOUT, notifications.recv())
        .await
        .expect("Test timed out waiting for shutdown");
    assert_eq!(next, None);
    cleanup_socket(&path);
}

/// Test: registrations that arrive after teardown resolve immediately
/// instead of suspending on a dead connection.
#[tokio::test]
async fn test_subscribe_after_teardown_ends_immediately() {
    let (client, server, path) = connect_ready("late_subscribe").await;

    drop(server);
    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("Test timed out waiting for teardown");

    let mut late = client.subscribe();
    let next = timeout(TEST_TIMEOUT, late.recv())
        .await
        .expect("Test timed out");
    assert_eq!(next, None);
    cleanup_socket(&path);
}

/// Test: dialing retries until the daemon appears instead of failing.
#[tokio::test]
async fn test_connect_retries_until_socket_exists() {
    let path = test_socket_path("dial_retry");
    let client = MoonrakerClient::connect(&path, ClientIdentity::default());

    // Let the first dial attempt fail before the socket exists.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ConnectionState::Connecting);

    let listener = UnixListener::bind(&path).expect("bind test socket");
    let mut server = TestServer::accept(&listener).await;
    server.handle_identify().await;

    timeout(TEST_TIMEOUT, client.wait_ready())
        .await
        .expect("Test timed out")
        .expect("Handshake should succeed after retry");
    cleanup_socket(&path);
}
