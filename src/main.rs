//! moonbridge - republishes Moonraker state changes to a chat channel.
//!
//! The process keeps one connection to the local Moonraker daemon for its
//! whole lifetime. Disconnection is fatal by design: the process exits
//! non-zero and the supervisor restarts it with clean session state.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use moonbridge::config::{self, Options};
use moonbridge::events::{self, LogSink};
use moonbridge::presets::PresetBook;
use moonbridge::rpc::{ClientIdentity, MoonrakerClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "moonbridge=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("Starting moonbridge v{}", env!("CARGO_PKG_VERSION"));

    let options = Options::parse();

    let presets = match &options.presets {
        Some(path) => match PresetBook::load(path) {
            Ok(book) => {
                info!("Loaded {} API presets from {}", book.len(), path.display());
                book
            }
            Err(e) => {
                warn!("Failed to load API presets: {}", e);
                PresetBook::empty()
            }
        },
        None => PresetBook::empty(),
    };
    for preset in presets.iter() {
        debug!(
            "preset: {} {}",
            preset.method.as_deref().unwrap_or("<invalid>"),
            preset.params.as_ref().map(|p| p.to_string()).unwrap_or_default()
        );
    }

    let socket_path = options.socket_path();
    let client = MoonrakerClient::connect(&socket_path, ClientIdentity::default());
    client.wait_ready().await?;
    info!("Connected to Moonraker at {}", socket_path.display());

    let hostname = config::hostname();
    let notifications = client.subscribe();
    let announcer = tokio::spawn(async move {
        events::announce_job_events(notifications, &LogSink, &hostname).await;
    });

    // Runs until the connection tears down; all session state dies with the
    // process rather than limping through a half-reset reconnect.
    client.closed().await;
    announcer.await?;
    anyhow::bail!("connection to Moonraker closed")
}
