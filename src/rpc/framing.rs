//! ETX-delimited message framing for JSON-RPC over Unix sockets.
//!
//! Moonraker terminates every JSON document on its Unix socket with a single
//! 0x03 (ETX) byte. That byte can never appear inside valid UTF-8 JSON text,
//! so it is an unambiguous frame boundary and no escaping is required.
//!
//! # Wire Format
//!
//! ```text
//! <json-document>0x03<json-document>0x03...
//! ```
//!
//! Decode failures are reported as [`FrameError::Malformed`], distinct from
//! stream-end and I/O failures, so the connection read loop can skip bad
//! frames under its error budget instead of tearing down immediately.
//!
//! [`FrameReader`] decodes incrementally and enforces [`MAX_FRAME_SIZE`]
//! while the frame is still arriving, so a peer streaming an oversized or
//! never-terminated frame is rejected at the cap rather than buffered whole.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::rpc::protocol::RpcRequest;

/// Frame terminator byte (ASCII ETX).
pub const FRAME_TERMINATOR: u8 = 0x03;

/// Maximum frame size (20MB), matching Moonraker's own socket buffer limit.
pub const MAX_FRAME_SIZE: usize = 20 * 1024 * 1024;

/// Framing-level error types.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream, either cleanly between frames or in the
    /// middle of one.
    #[error("connection closed by peer")]
    Closed,

    /// The frame was not valid UTF-8 JSON or exceeded [`MAX_FRAME_SIZE`].
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// I/O error while reading from the socket.
    #[error("socket read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a request and append the frame terminator.
///
/// Produces `{"jsonrpc":"2.0","method":M,"id":N,"params":P}` followed by a
/// single 0x03 byte; `params` is omitted when the request carries none.
///
/// # Errors
///
/// Returns an error if the request cannot be serialized to JSON.
pub fn encode_request(request: &RpcRequest) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(request)?;
    frame.push(FRAME_TERMINATOR);
    Ok(frame)
}

/// Incremental decoder for the inbound half of the stream.
///
/// Memory use is bounded: at most [`MAX_FRAME_SIZE`] plus one buffered read
/// is ever held for a single frame, and the remainder of a rejected
/// oversized frame is skipped without being accumulated.
pub struct FrameReader {
    reader: BufReader<OwnedReadHalf>,
    /// Set when an oversized frame was rejected mid-stream; the next read
    /// first skips to the terminator to realign.
    discarding: bool,
}

impl FrameReader {
    pub fn new(read_half: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(read_half),
            discarding: false,
        }
    }

    /// Read one terminated frame from the stream and decode it as JSON.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Closed`] on EOF, including EOF before the terminator
    ///   of a partially received frame
    /// - [`FrameError::Malformed`] if the frame exceeds [`MAX_FRAME_SIZE`]
    ///   (reported as soon as the cap is crossed, not once the frame
    ///   completes), is not UTF-8, or is not valid JSON; the stream stays
    ///   usable and the next call yields the following frame
    /// - [`FrameError::Io`] if the underlying read fails
    pub async fn read_frame(&mut self) -> Result<serde_json::Value, FrameError> {
        if self.discarding {
            self.skip_to_terminator().await?;
            self.discarding = false;
        }

        let mut buf = Vec::new();
        loop {
            let (consumed, complete) = {
                let chunk = self.reader.fill_buf().await?;
                // EOF: between frames if nothing is buffered, otherwise the
                // partial frame can never complete. Closed either way.
                if chunk.is_empty() {
                    return Err(FrameError::Closed);
                }
                match chunk.iter().position(|&b| b == FRAME_TERMINATOR) {
                    Some(pos) => {
                        buf.extend_from_slice(&chunk[..pos]);
                        (pos + 1, true)
                    }
                    None => {
                        buf.extend_from_slice(chunk);
                        (chunk.len(), false)
                    }
                }
            };
            self.reader.consume(consumed);

            if buf.len() > MAX_FRAME_SIZE {
                // Unterminated overflow: the rest of this frame is skipped
                // on the next call instead of being buffered.
                self.discarding = !complete;
                return Err(FrameError::Malformed(format!(
                    "frame exceeds maximum {} bytes",
                    MAX_FRAME_SIZE
                )));
            }
            if complete {
                break;
            }
        }

        let text = std::str::from_utf8(&buf)
            .map_err(|e| FrameError::Malformed(format!("invalid UTF-8: {}", e)))?;

        serde_json::from_str(text)
            .map_err(|e| FrameError::Malformed(format!("invalid JSON: {}", e)))
    }

    /// Consume input through the next terminator without buffering it.
    async fn skip_to_terminator(&mut self) -> Result<(), FrameError> {
        loop {
            let (consumed, done) = {
                let chunk = self.reader.fill_buf().await?;
                if chunk.is_empty() {
                    return Err(FrameError::Closed);
                }
                match chunk.iter().position(|&b| b == FRAME_TERMINATOR) {
                    Some(pos) => (pos + 1, true),
                    None => (chunk.len(), false),
                }
            };
            self.reader.consume(consumed);
            if done {
                return Ok(());
            }
        }
    }
}

/// Write a fully encoded frame (terminator included) and flush.
///
/// Callers serialize access to the write half so concurrent senders cannot
/// interleave partial frames.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
