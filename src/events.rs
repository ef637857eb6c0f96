//! Job state notifications mapped to chat announcements.
//!
//! This is the thin downstream layer over the RPC core: it watches raw
//! notification frames, picks out `notify_history_changed` events that mark
//! print job transitions, and turns them into messages for a chat sink. The
//! chat-platform integration itself lives outside this crate behind the
//! [`ChatSink`] trait.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::rpc::{frame_method, NotificationStream};

/// Moonraker notification method carrying print-history changes.
const HISTORY_CHANGED: &str = "notify_history_changed";

/// Process-stat updates arrive every second; not worth logging.
const PROC_STAT_UPDATE: &str = "notify_proc_stat_update";

/// A user-facing print job transition derived from a notification frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started { filename: String },
    Completed { filename: String },
    Cancelled { filename: String },
    Paused { filename: String },
}

impl JobEvent {
    /// Classify a raw notification frame.
    ///
    /// Only `notify_history_changed` frames whose first params entry carries
    /// an action and a job status map to an event; anything else - other
    /// methods, unknown action/status pairs, missing fields - is `None`.
    pub fn from_frame(frame: &Value) -> Option<Self> {
        if frame_method(frame)? != HISTORY_CHANGED {
            return None;
        }
        let entry = frame.get("params")?.get(0)?;
        let action = entry.get("action")?.as_str()?;
        let job = entry.get("job")?;
        let status = job.get("status")?.as_str()?;
        let filename = job.get("filename")?.as_str()?.to_string();

        match (action, status) {
            ("added", "in_progress") => Some(Self::Started { filename }),
            ("finished", "completed") => Some(Self::Completed { filename }),
            ("finished", "cancelled") => Some(Self::Cancelled { filename }),
            ("finished", "paused") => Some(Self::Paused { filename }),
            _ => None,
        }
    }

    /// Chat message for this event.
    ///
    /// Start messages carry the machine name so a print-farm channel fed by
    /// several bridges can tell the printers apart.
    pub fn message(&self, hostname: &str) -> String {
        match self {
            Self::Started { filename } => {
                format!("Machine {} ==> Job {} started", hostname, filename)
            }
            Self::Completed { filename } => format!("Job {} completed", filename),
            Self::Cancelled { filename } => format!("Job {} cancelled", filename),
            Self::Paused { filename } => format!("Job {} paused", filename),
        }
    }
}

/// Destination for job announcements.
///
/// The chat-platform integration implements this; the core never learns
/// about channels or message formats beyond the plain announcement text.
pub trait ChatSink: Send + Sync {
    /// Deliver one announcement.
    fn announce(&self, message: &str) -> anyhow::Result<()>;
}

/// Sink that writes announcements to the process log. Useful standalone and
/// as the fallback when no chat backend is configured.
#[derive(Debug, Default)]
pub struct LogSink;

impl ChatSink for LogSink {
    fn announce(&self, message: &str) -> anyhow::Result<()> {
        info!("{}", message);
        Ok(())
    }
}

/// Drain a notification stream, announcing job events until the stream ends
/// (i.e. until the connection tears down).
///
/// A failing sink is logged and skipped; it never stops the loop or feeds
/// back into the connection.
pub async fn announce_job_events(
    mut stream: NotificationStream,
    sink: &dyn ChatSink,
    hostname: &str,
) {
    while let Some(frame) = stream.recv().await {
        if let Some(event) = JobEvent::from_frame(&frame) {
            let message = event.message(hostname);
            if let Err(e) = sink.announce(&message) {
                warn!(error = %e, "failed to announce job event");
            }
        } else if frame_method(&frame) != Some(PROC_STAT_UPDATE) {
            debug!("notification: {}", frame);
        }
    }
    debug!("notification stream ended");
}
