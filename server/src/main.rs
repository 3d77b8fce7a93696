#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # hookgate
//!
//! Gateway between phones and webhooks.
//!
//! Devices hold a WebSocket open to the gateway. SMS and notifications they
//! capture are matched against their owner's forwarding rules and delivered
//! to the rules' webhooks through a durable retrying queue. Users queue
//! outbound SMS on their devices over HTTP.
//!
//! ## API surface
//!
//! | Method | Path                  | Auth   | Description                  |
//! |--------|-----------------------|--------|------------------------------|
//! | GET    | `/api/health`         | No     | Liveness probe               |
//! | GET    | `/api/device/ws`      | In-band `AUTH` | Device WebSocket     |
//! | POST   | `/api/sms/send`       | Bearer | Send an SMS via a device     |
//! | GET    | `/api/devices/online` | Bearer | Caller's connected devices   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, startup and graceful shutdown
//! config.rs        TOML + env-var configuration
//! protocol.rs      device wire envelope and message kinds
//! registry.rs      device → live session map
//! session.rs       handshake, read loop, write loop, heartbeat
//! events.rs        inbound device events → log → match → delivery jobs
//! matcher.rs       forwarding rule filters
//! delivery/
//!   mod.rs         queue, worker pool, retry
//!   journal.rs     write-ahead journal
//!   webhook.rs     HTTP transport
//! outbound.rs      send-SMS commands
//! store/           collaborator traits + in-memory store
//! routes/          HTTP handlers
//! auth.rs          Bearer API key middleware
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use hookgate::delivery::webhook::WebhookClient;
use hookgate::store::memory::MemoryStore;
use hookgate::store::Stores;
use hookgate::{routes, AppState, Config, DeliveryQueue};

/// Seconds between idle-session sweeps.
const SWEEP_INTERVAL_SECS: u64 = 30;

/// Device-to-webhook gateway.
#[derive(Parser)]
#[command(name = "hookgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("hookgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let store = match config.server.fixtures.as_deref() {
        Some(path) => MemoryStore::from_fixtures_file(Path::new(path))
            .await
            .unwrap_or_else(|e| panic!("Failed to load fixtures {path}: {e}")),
        None => {
            warn!("No fixtures configured: no accounts exist until one is seeded");
            MemoryStore::new()
        }
    };
    let stores = Stores::from_memory(Arc::new(store));

    let retry = config.retry_policy();
    let transport =
        WebhookClient::new(retry.attempt_timeout).expect("Failed to build HTTP client");
    let queue = DeliveryQueue::start(
        config.queue_settings(),
        Arc::new(transport),
        stores.logs.clone(),
    )
    .await
    .unwrap_or_else(|e| panic!("Failed to open delivery journal in {}: {e}", config.server.data_dir));

    let state = AppState::new(config, stores, queue);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: evict sessions that went silent without closing
    let registry = state.registry.clone();
    let read_timeout = state.session.read_timeout;
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let evicted = registry.sweep_idle(read_timeout).await;
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Swept idle device sessions");
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    // Device sessions are long-lived upgrades; close them when the signal
    // arrives so the server can finish draining.
    let registry = state.registry.clone();
    let shutdown = async move {
        shutdown.await;
        registry.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    state.queue.shutdown().await;
    info!("Goodbye");
}
