//! Moonraker JSON-RPC connection core.
//!
//! This module owns the hard part of the bridge: framing messages on the
//! wire, matching responses to pending callers by request identifier,
//! telling unsolicited push notifications apart from replies, and fanning
//! notifications out to consumers without blocking the read loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐         Unix Socket          ┌───────────────┐
//! │  moonbridge  │ ◄───────────────────────────►│   Moonraker   │
//! │ (MoonrakerClient)   JSON-RPC 2.0 + 0x03     │   (daemon)    │
//! └──────────────┘         framing              └───────────────┘
//! ```
//!
//! Inbound frames flow socket → codec → router → pending call or listener;
//! outbound requests flow caller → correlator → codec → socket.
//!
//! # Usage
//!
//! ```ignore
//! use moonbridge::rpc::{ClientIdentity, MoonrakerClient};
//! use serde_json::json;
//!
//! let client = MoonrakerClient::connect("/tmp/moonraker.sock", ClientIdentity::default());
//! client.wait_ready().await?;
//! let info = client.call("server.info", json!({})).await?;
//! ```

mod client;
mod framing;
mod protocol;
mod router;

pub use client::{ConnectionState, MoonrakerClient, NotificationStream, RpcError};
pub use framing::{
    encode_request, write_frame, FrameError, FrameReader, FRAME_TERMINATOR, MAX_FRAME_SIZE,
};
pub use protocol::{frame_id, frame_method, ClientIdentity, RpcRequest, IDENTIFY_METHOD};
