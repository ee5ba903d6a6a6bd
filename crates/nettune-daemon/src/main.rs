//! nettune-daemon - HTTP API server for the nettune control plane.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use nettune_core::{
    ApplyEngine, HistoryJournal, HostAdapter, ManagedPaths, ProfileStore, SnapshotStore,
    StatePaths,
};
use nettune_daemon::api;
use nettune_daemon::api::rate_limit::{RateLimitConfig, RateLimiter};
use nettune_daemon::state::AppState;

/// nettune API server
#[derive(Parser, Debug)]
#[command(name = "nettune-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// API key clients must present as a bearer token
    #[arg(long, env = "NETTUNE_API_KEY")]
    api_key: String,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9876")]
    listen: SocketAddr,

    /// Directory for state storage (profiles, snapshots, history)
    #[arg(long)]
    state_dir: Option<std::path::PathBuf>,

    /// Requests accepted per client IP per rate-limit interval
    #[arg(long, default_value_t = 300)]
    rate_limit_burst: u32,

    /// Rate-limit interval in seconds
    #[arg(long, default_value_t = 1)]
    rate_limit_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let state_paths = match &args.state_dir {
        Some(dir) => StatePaths::new(dir.clone()),
        None => StatePaths::default(),
    };
    info!(
        listen = %args.listen,
        state_dir = %state_paths.root().display(),
        "starting nettune daemon"
    );

    let host = HostAdapter::linux();
    let managed = ManagedPaths::default();
    let snapshots = SnapshotStore::new(state_paths.snapshots_dir(), host.clone(), managed.clone())
        .context("initialize snapshot store")?;
    let history =
        HistoryJournal::new(state_paths.history_dir()).context("initialize history journal")?;
    let engine = ApplyEngine::new(
        ProfileStore::new(state_paths.profiles_dir()),
        snapshots,
        history,
        host.clone(),
        managed,
    );

    let state = Arc::new(AppState {
        engine,
        host,
        api_key: args.api_key,
        limiter: RateLimiter::new(RateLimitConfig {
            burst: args.rate_limit_burst,
            interval: Duration::from_secs(args.rate_limit_interval_secs.max(1)),
        }),
    });

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serve HTTP API")?;

    info!("nettune daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
}
