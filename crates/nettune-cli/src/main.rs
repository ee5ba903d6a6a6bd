//! nettune - measurement client and remote control for the nettune daemon.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use nettune_core::apply::{ApplyMode, ApplyRequest, RollbackRequest};

mod client;
mod probe;

use client::ApiClient;
use probe::throughput::Direction;

/// nettune - end-to-end network measurement and TCP tuning client
#[derive(Parser, Debug)]
#[command(name = "nettune")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server URL
    #[arg(long, default_value = "http://127.0.0.1:9876", env = "NETTUNE_SERVER")]
    server: String,

    /// API key for authentication
    #[arg(long, env = "NETTUNE_API_KEY")]
    api_key: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure round-trip time with serial echoes
    Rtt {
        /// Number of echo round trips
        #[arg(long, default_value_t = 20)]
        count: usize,
    },

    /// Measure throughput over parallel connections
    Throughput {
        /// Transfer direction
        #[arg(value_enum)]
        direction: Direction,

        /// Total bytes to transfer across all connections
        #[arg(long, default_value_t = 100 * 1024 * 1024)]
        bytes: u64,

        /// Number of parallel connections
        #[arg(long, default_value_t = 4)]
        parallel: usize,
    },

    /// Measure latency while saturating the path with downloads
    LatencyLoad {
        /// Length of the load window in seconds
        #[arg(long, default_value_t = 10)]
        duration_sec: u64,

        /// Number of parallel load workers
        #[arg(long, default_value_t = 4)]
        load_parallel: usize,

        /// Echo probe interval in milliseconds
        #[arg(long, default_value_t = 100)]
        echo_interval_ms: u64,
    },

    /// Show server host facts
    Info,

    /// Show system status (last apply, current state, snapshots)
    Status,

    /// List available tuning profiles
    Profiles,

    /// Show one profile
    Profile {
        /// Profile id
        id: String,
    },

    /// Apply a profile
    Apply {
        /// Profile id
        profile_id: String,

        /// Mutate the host instead of the default dry run
        #[arg(long)]
        commit: bool,

        /// Roll back automatically this many seconds after a successful
        /// commit
        #[arg(long)]
        auto_rollback_seconds: Option<u64>,
    },

    /// Roll back to a snapshot
    Rollback {
        /// Snapshot id to restore
        #[arg(long, conflicts_with = "last")]
        snapshot_id: Option<String>,

        /// Restore the most recent snapshot
        #[arg(long)]
        last: bool,
    },

    /// List snapshots
    Snapshots,

    /// Capture a snapshot of current host state
    Snapshot,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let client = ApiClient::new(
        cli.server.clone(),
        cli.api_key.clone(),
        Duration::from_secs(cli.timeout),
    )
    .context("build API client")?;

    match cli.command {
        Commands::Rtt { count } => print_json(&probe::rtt::measure(&client, count)?),
        Commands::Throughput {
            direction,
            bytes,
            parallel,
        } => print_json(&probe::throughput::measure(&client, direction, bytes, parallel)),
        Commands::LatencyLoad {
            duration_sec,
            load_parallel,
            echo_interval_ms,
        } => print_json(&probe::latency_load::measure(
            &client,
            duration_sec,
            load_parallel,
            echo_interval_ms,
        )?),
        Commands::Info => print_json(&client.server_info()?),
        Commands::Status => print_json(&client.status()?),
        Commands::Profiles => print_json(&client.profiles()?),
        Commands::Profile { id } => print_json(&client.profile(&id)?),
        Commands::Apply {
            profile_id,
            commit,
            auto_rollback_seconds,
        } => {
            let request = ApplyRequest {
                profile_id,
                mode: if commit {
                    ApplyMode::Commit
                } else {
                    ApplyMode::DryRun
                },
                auto_rollback_seconds,
            };
            print_json(&client.apply(&request)?)
        }
        Commands::Rollback { snapshot_id, last } => {
            let request = RollbackRequest {
                snapshot_id,
                rollback_last: last,
            };
            print_json(&client.rollback(&request)?)
        }
        Commands::Snapshots => print_json(&client.snapshots()?),
        Commands::Snapshot => print_json(&client.create_snapshot()?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}
