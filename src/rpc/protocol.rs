//! JSON-RPC 2.0 message types for the Moonraker wire protocol.
//!
//! Outbound requests are typed; inbound frames stay as raw
//! [`serde_json::Value`] documents because notification payloads are
//! open-ended and downstream consumers classify them themselves.

use serde::Serialize;
use serde_json::Value;

/// Method name of the mandatory per-connection identification call.
pub const IDENTIFY_METHOD: &str = "server.connection.identify";

/// An outbound JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    jsonrpc: &'static str,
    /// RPC method name (e.g. "printer.objects.query").
    pub method: String,
    /// Request identifier, unique for the lifetime of the connection.
    pub id: u64,
    /// Parameter object; omitted from the wire form when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Build a request. Null or empty-object params are dropped so the wire
    /// form omits the `params` key entirely.
    pub fn new(method: &str, params: Value, id: u64) -> Self {
        let params = match params {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            other => Some(other),
        };
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            id,
            params,
        }
    }
}

/// Identification payload sent exactly once per connection, before any
/// other request is permitted through.
///
/// Moonraker requires the four string fields; the values describe this
/// client and default to the crate's own metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ClientIdentity {
    pub client_name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub client_type: String,
    pub url: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            client_type: "other".to_string(),
            url: "https://github.com/uboe-sas/moonbridge".to_string(),
        }
    }
}

impl ClientIdentity {
    /// The identity as a params object for the identify call.
    pub fn to_params(&self) -> Value {
        serde_json::json!({
            "client_name": self.client_name,
            "version": self.version,
            "type": self.client_type,
            "url": self.url,
        })
    }
}

/// Extract the numeric request identifier from an inbound frame, if any.
pub fn frame_id(frame: &Value) -> Option<u64> {
    frame.get("id").and_then(Value::as_u64)
}

/// Extract the method name from an inbound frame, if any.
pub fn frame_method(frame: &Value) -> Option<&str> {
    frame.get("method").and_then(Value::as_str)
}
