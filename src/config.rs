//! Process configuration: CLI options and default path resolution.

use std::path::PathBuf;

use clap::Parser;

/// Bridge between a Moonraker printer daemon and a chat channel.
#[derive(Debug, Parser)]
#[command(name = "moonbridge", version, about)]
pub struct Options {
    /// Path to Moonraker's Unix domain socket.
    #[arg(short, long, value_name = "SOCKETFILE")]
    pub socket: Option<PathBuf>,

    /// Path to an API presets JSON file.
    #[arg(short, long, value_name = "PRESETFILE")]
    pub presets: Option<PathBuf>,
}

impl Options {
    /// Socket path: explicit flag wins, then the default resolution.
    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(default_socket_path)
    }
}

/// Resolve the default socket path for Moonraker.
///
/// Resolution order:
/// 1. `MOONRAKER_SOCKET` environment variable
/// 2. `~/printer_data/comms/moonraker.sock` (stock Moonraker layout)
/// 3. `/tmp/moonraker.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("MOONRAKER_SOCKET") {
        return PathBuf::from(path);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join("printer_data/comms/moonraker.sock");
    }

    PathBuf::from("/tmp/moonraker.sock")
}

/// Machine name used in job-start announcements so a farm channel can tell
/// printers apart.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "moonbridge".to_string())
}
