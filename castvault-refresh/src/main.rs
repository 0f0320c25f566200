//! castvault-refresh - Background daemon for OAuth token refresh
//!
//! Wakes on a fixed interval, refreshes every token that expires within the
//! lookahead window, and escalates accounts that keep failing.

use clap::Parser;
use libcastvault::config::{CONFIG_ENV, WORKER_INDEX_ENV};
use libcastvault::{logging, Config, CredentialService, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "castvault-refresh")]
#[command(version)]
#[command(about = "Background daemon that refreshes OAuth tokens before they expire")]
#[command(long_about = "\
castvault-refresh - Background daemon for OAuth token refresh

DESCRIPTION:
    castvault-refresh wakes up on a fixed interval and refreshes every
    connected account whose access token expires within the lookahead
    window. Accounts that fail repeatedly are marked as needing
    re-authorization and are left alone until the user reconnects them.

    When several copies run side by side, only the elected leader refreshes.
    Leadership is either a static worker index or a lease in the database.

USAGE:
    # Run in foreground (logs to stderr)
    castvault-refresh

    # Run a single cycle and print the report as JSON
    castvault-refresh --once

    # Run as worker 2 of a fleet where worker 1 is designated
    castvault-refresh --worker-index 2

    # Only warm the cache for users active in the last 6 hours
    castvault-refresh --warm-window 6h

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (waits for the current cycle)

CONFIGURATION:
    Configuration file: ~/.config/castvault/config.toml
    Master key: CASTVAULT_MASTER_KEY (base64, 32 bytes)

    [refresh]
    interval_secs = 300       # seconds between cycles
    lookahead_secs = 600      # refresh tokens expiring within this window
    failure_threshold = 3     # consecutive failures before re-auth

    [refresh.leader]
    mode = \"static\"           # or \"lease\"
    designated_worker = 1

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime or configuration error
    3 - Invalid input
")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH", env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Index of this worker within the deployment
    #[arg(long, value_name = "N", env = WORKER_INDEX_ENV)]
    worker_index: Option<u32>,

    /// Warm the enabled-accounts cache for users active within this window
    #[arg(long, value_name = "DURATION", default_value = "24h", value_parser = humantime::parse_duration)]
    warm_window: Duration,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run one refresh cycle, print the report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_default(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let service = CredentialService::from_config(config, cli.worker_index).await?;
    let scheduler = service.scheduler().clone();

    if cli.once {
        let now = chrono::Utc::now().timestamp();
        match scheduler.tick(now).await? {
            Some(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            None => println!("Not the leader; no refresh cycle was run"),
        }
        return Ok(());
    }

    info!("castvault-refresh daemon starting");

    let since = chrono::Utc::now().timestamp() - cli.warm_window.as_secs() as i64;
    match service.warm_recent_users(since).await {
        Ok(warmed) => info!(warmed, "Warmed enabled-accounts cache"),
        Err(e) => warn!("Cache warm-up failed: {}", e),
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    scheduler.start_monitoring();
    while !shutdown.load(Ordering::Relaxed) {
        sleep(Duration::from_secs(1)).await;
    }

    info!("Shutdown requested, waiting for the current cycle");
    scheduler.stop().await;
    info!("castvault-refresh daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}
