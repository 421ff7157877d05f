//! Room monitor binary entry point
//!
//! Joins a room as a silent observer (no producing, no consuming) and logs
//! every peer, consumer, notification and state change until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Observe a room on the public demo server
//! cargo run --bin room_monitor -- --room-id my-room
//!
//! # Load options from a TOML file, override the server
//! cargo run --bin room_monitor -- \
//!   --config ./room.toml \
//!   --server-host sfu.example.com \
//!   --server-port 4443
//! ```

use anyhow::Context;
use clap::Parser;
use sfu_room_client::{
    ConnectionState, NullCapture, PassiveEngine, ReconnectPolicy, RoomClient, RoomEvent,
    RoomOptions,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// SFU room monitor
///
/// Joins a room without sending or receiving media and logs room events.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML options file (ROOM_* environment variables are used otherwise)
    #[arg(short, long, env = "ROOM_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling server host
    #[arg(long)]
    server_host: Option<String>,

    /// Signaling server port
    #[arg(long)]
    server_port: Option<u16>,

    /// Room to observe (random if empty)
    #[arg(long)]
    room_id: Option<String>,

    /// Local peer id (random if empty)
    #[arg(long)]
    peer_id: Option<String>,

    /// Display name shown to other participants
    #[arg(long, default_value = "room-monitor")]
    display_name: String,

    /// Do not reconnect automatically after a signaling drop
    #[arg(long, default_value_t = false)]
    manual_reconnect: bool,
}

fn build_options(args: &Args) -> anyhow::Result<RoomOptions> {
    let mut options = match &args.config {
        Some(path) => RoomOptions::from_toml_file(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => RoomOptions::from_env().context("loading options from environment")?,
    };

    if let Some(host) = &args.server_host {
        options.server_host = host.clone();
    }
    if let Some(port) = args.server_port {
        options.server_port = port;
    }
    if let Some(room_id) = &args.room_id {
        options.room_id = room_id.clone();
    }
    if let Some(peer_id) = &args.peer_id {
        options.peer_id = peer_id.clone();
    }
    if options.display_name.is_empty() {
        options.display_name = args.display_name.clone();
    }
    if args.manual_reconnect {
        options.reconnect = ReconnectPolicy::Manual;
    }

    // Observer only
    Ok(options.with_media(false, false))
}

fn log_event(client: &RoomClient, event: RoomEvent) {
    match event {
        RoomEvent::StateChanged(state) => info!(?state, "Room state changed"),
        RoomEvent::Notify(notify) => info!(level = ?notify.level, "{}", notify.text),
        RoomEvent::PeerAdded(id) => {
            let name = client
                .snapshot()
                .peers
                .get(&id)
                .and_then(|p| p.display_name.clone())
                .unwrap_or_default();
            info!(peer_id = %id, display_name = %name, "Peer joined");
        }
        RoomEvent::PeerRemoved(id) => info!(peer_id = %id, "Peer left"),
        RoomEvent::RoomInfoChanged => {
            let snapshot = client.snapshot();
            info!(
                active_speaker = ?snapshot.room.active_speaker_id,
                "Room info changed"
            );
        }
        other => tracing::debug!(?other, "Room event"),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("\nCtrl+C received, leaving the room...");
    })
    .context("installing Ctrl+C handler")?;

    let options = build_options(&args)?;
    let client = RoomClient::new(options, Arc::new(PassiveEngine::new()), Arc::new(NullCapture))
        .context("creating room client")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "{}",
        client.store().room_info_text()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .thread_name("room-monitor")
        .enable_all()
        .build()
        .context("building monitor runtime")?;

    let result = runtime.block_on(async_main(&client, shutdown_flag));

    client.close();
    client.dispose();
    info!("Room monitor stopped");
    result
}

/// Log room events until Ctrl+C or until the room closes for good
async fn async_main(client: &RoomClient, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut events = client.subscribe();
    client.join();

    let shutdown = async move {
        while !shutdown_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(RoomEvent::StateChanged(ConnectionState::Closed)) => {
                    warn!("Room closed, exiting");
                    break;
                }
                Ok(event) => log_event(client, event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
