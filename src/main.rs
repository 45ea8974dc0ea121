//! radish-server: the Radish server binary.
//!
//! Parses the command line, wires up logging, and runs a controller until
//! SIGINT or SIGTERM asks for a graceful shutdown.

use clap::Parser;
use radish::{Config, Controller, CoreConfig, SyncPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(
    name = "radish-server",
    version,
    about = "In-memory key-value store with Redis-compatible semantics"
)]
struct Args {
    /// Host to listen on
    #[arg(short = 'H', long, default_value = radish::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = radish::DEFAULT_PORT)]
    port: u16,

    /// Data directory; an empty value disables persistence
    #[arg(short = 'd', long, default_value = "")]
    data_dir: String,

    /// Expired items collection interval, seconds
    #[arg(short = 'e', long, default_value_t = 100)]
    collect_interval: u64,

    /// Merge WAL into snapshot interval, seconds
    #[arg(short = 'm', long, default_value_t = 600)]
    merge_wal_interval: u64,

    /// WAL sync policy: 0 - never, 1 - once per second, 2 - always
    #[arg(short = 's', long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    sync_policy: u8,

    /// Serve the HTTP API instead of RESP
    #[arg(long)]
    http: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable logging entirely
    #[arg(short = 'q', long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if !args.quiet {
        let level = match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .init();
    }

    let config = Config {
        host: args.host,
        port: args.port,
        data_dir: if args.data_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(args.data_dir))
        },
        sync_policy: match args.sync_policy {
            0 => SyncPolicy::Never,
            1 => SyncPolicy::Sometimes,
            _ => SyncPolicy::Always,
        },
        collect_interval: Duration::from_secs(args.collect_interval),
        merge_wal_interval: Duration::from_secs(args.merge_wal_interval),
        use_http: args.http,
        core: CoreConfig::default(),
    };

    let controller = Controller::new(config);
    tokio::spawn(handle_signals(Arc::clone(&controller)));

    controller.run().await?;
    Ok(())
}

async fn handle_signals(controller: Arc<Controller>) {
    let mut terminate =
        signal::unix::signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown signal received, stopping server");
    controller.shutdown();
}
