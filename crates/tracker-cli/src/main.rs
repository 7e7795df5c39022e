//! The tracker binary: load settings, join a federation (or stand alone),
//! start the broadcaster, and serve the HTTP surface.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::TrackerConfig;
use tracker_broadcast::{BroadcastConfig, Broadcaster};
use tracker_store::Store;

#[derive(Parser)]
#[command(name = "tracker")]
#[command(about = "A federated file tracker", long_about = None)]
struct Cli {
    /// Specify a nonstandard config file.
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Specify an initial tracker IP to join through, or "none" to start
    /// standalone. Defaults to trying any trackers already on file.
    #[arg(short = 't', long, value_name = "IP")]
    initial_tracker: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings = TrackerConfig::load(&cli.config);
    let initial_tracker = cli.initial_tracker.as_deref().map(|s| s.to_lowercase());

    let store = Arc::new(Store::open(&settings.db_path)?);

    let seed = tracker_bootstrap::resolve_seed(initial_tracker.as_deref(), &store)?;
    tracker_bootstrap::bootstrap(&store, seed, settings.server_port).await?;

    let broadcaster = Broadcaster::new(
        BroadcastConfig {
            worker_count: settings.broadcast_thread_count,
            max_tracker_failures: settings.max_tracker_failures,
            port: settings.server_port,
            ..BroadcastConfig::default()
        },
        store.clone(),
    );
    let known: Vec<String> = store.list_trackers()?.into_iter().map(|t| t.ip).collect();
    broadcaster.seed_trackers(known).await;
    broadcaster.start().await;

    let dead_tracker = broadcaster.dead_tracker_signal();

    let state = tracker_http::AppState {
        store,
        broadcaster: broadcaster.clone(),
        keep_alive_timeout: settings.keepalive_timeout,
    };
    let app = tracker_http::router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tracker listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = dead_tracker.notified() => {
            tracing::warn!("evicted by a sibling tracker, shutting down");
            broadcaster.interrupt();
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
            broadcaster.interrupt();
        }
    }

    Ok(())
}
