//! Moonbridge Library
//!
//! This library provides the core components of the Moonraker chat bridge:
//!
//! - `rpc` - persistent JSON-RPC connection to Moonraker over a Unix socket,
//!   with request correlation and notification fan-out
//! - `events` - mapping of raw notifications to print job events and the
//!   chat sink seam
//! - `presets` - API request presets loaded from a JSON file
//! - `config` - CLI options and default path resolution
//!
//! # RPC Module
//!
//! The `rpc` module is the entry point for talking to Moonraker:
//!
//! ```ignore
//! use moonbridge::rpc::{ClientIdentity, MoonrakerClient};
//! use serde_json::json;
//!
//! let client = MoonrakerClient::connect("/tmp/moonraker.sock", ClientIdentity::default());
//! client.wait_ready().await?;
//! let info = client.call("server.info", json!({})).await?;
//! let mut notifications = client.subscribe();
//! ```

pub mod config;
pub mod events;
pub mod presets;
pub mod rpc;
