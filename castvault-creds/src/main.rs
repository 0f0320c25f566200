//! castvault-creds - Operator tool for stored OAuth credentials
//!
//! Inspect token health, force refreshes, manage agent toggles and migrate
//! legacy envelopes without going through the web application.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libcastvault::config::CONFIG_ENV;
use libcastvault::{logging, CastvaultError, Config, CredentialService, HealthStatus};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "castvault-creds")]
#[command(version)]
#[command(about = "Inspect and maintain stored OAuth credentials", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true, value_name = "PATH", env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List a user's connected accounts, or those enabled for one agent
    Accounts {
        #[arg(long)]
        user: String,

        /// Only accounts enabled for this agent
        #[arg(long)]
        agent: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Enable or disable an account for an agent
    Toggle {
        #[arg(long)]
        user: String,

        #[arg(long)]
        agent: String,

        #[arg(long)]
        account: String,

        /// Disable instead of enable
        #[arg(long)]
        off: bool,
    },

    /// Disconnect an account
    Disconnect {
        #[arg(long)]
        user: String,

        #[arg(long)]
        account: String,
    },

    /// Show token health for every account of a user
    Health {
        #[arg(long)]
        user: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Refresh every account of a user now, including flagged ones
    ForceRefresh {
        #[arg(long)]
        user: String,
    },

    /// Re-encrypt legacy envelopes under the current master key
    Migrate,

    /// Print a freshly generated master key
    GenKey,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_default(cli.verbose);

    if let Err(e) = run_command(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<CastvaultError>()
        .map(CastvaultError::exit_code)
        .unwrap_or(1)
}

async fn run_command(cli: Cli) -> Result<()> {
    if let Commands::GenKey = cli.command {
        println!("{}", libcastvault::cipher::generate_master_key());
        return Ok(());
    }

    let service = open_service(cli.config.as_ref()).await?;

    match cli.command {
        Commands::Accounts { user, agent, json } => {
            list_accounts(&service, &user, agent.as_deref(), json).await
        }
        Commands::Toggle {
            user,
            agent,
            account,
            off,
        } => {
            service.set_agent_toggle(&user, &agent, &account, !off).await?;
            let state = if off { "disabled" } else { "enabled" };
            println!("✓ {} {} for agent {}", account, state, agent);
            Ok(())
        }
        Commands::Disconnect { user, account } => {
            service.disconnect_account(&user, &account).await?;
            println!("✓ Disconnected {}", account);
            Ok(())
        }
        Commands::Health { user, json } => show_health(&service, &user, json).await,
        Commands::ForceRefresh { user } => force_refresh(&service, &user).await,
        Commands::Migrate => migrate(&service).await,
        Commands::GenKey => Ok(()),
    }
}

/// The CLI never takes part in leader election
async fn open_service(path: Option<&PathBuf>) -> Result<CredentialService> {
    let config = match path {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load()?,
    };
    Ok(CredentialService::from_config(config, None).await?)
}

async fn list_accounts(
    service: &CredentialService,
    user: &str,
    agent: Option<&str>,
    json: bool,
) -> Result<()> {
    let accounts = match agent {
        Some(agent) => service.enabled_accounts(user, agent).await?,
        None => service.connected_accounts(user).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&accounts)?);
        return Ok(());
    }

    if accounts.is_empty() {
        println!("No accounts found for user {}", user);
        return Ok(());
    }

    for account in &accounts {
        let marker = if account.needs_reauth { " (needs re-auth)" } else { "" };
        println!(
            "  {:<10} {:<24} {}{}",
            account.platform, account.account_id, account.display_name, marker
        );
    }
    Ok(())
}

async fn show_health(service: &CredentialService, user: &str, json: bool) -> Result<()> {
    let health = service.token_health(user).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    if health.is_empty() {
        println!("No accounts found for user {}", user);
        return Ok(());
    }

    println!("Token health for {}:", user);
    println!();
    for entry in &health {
        let icon = match entry.status {
            HealthStatus::Healthy | HealthStatus::RefreshWindow => "✓",
            HealthStatus::ExpiringSoon => "!",
            HealthStatus::Expired | HealthStatus::NeedsReauth => "✗",
        };
        println!(
            "  {} {:<10} {:<24} {:<14} {:>6} min  failures: {}",
            icon,
            entry.platform,
            entry.account_id,
            entry.status,
            entry.minutes_until_expiry,
            entry.failure_count
        );
        if let Some(last_error) = &entry.last_error {
            println!("      last error: {}", last_error);
        }
    }
    Ok(())
}

async fn force_refresh(service: &CredentialService, user: &str) -> Result<()> {
    let report = service.force_refresh_user(user).await?;

    for detail in &report.details {
        if detail.success {
            println!("  ✓ {} ({})", detail.account_id, detail.platform);
        } else {
            println!(
                "  ✗ {} ({}): {}",
                detail.account_id,
                detail.platform,
                detail.message.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!();
    println!(
        "Refreshed {} account(s), {} failed",
        report.success_count, report.failed_count
    );

    if report.failed_count > 0 {
        anyhow::bail!("{} account(s) could not be refreshed", report.failed_count);
    }
    Ok(())
}

async fn migrate(service: &CredentialService) -> Result<()> {
    let report = service.migrate_legacy_records().await?;

    println!("Migration complete:");
    println!("  migrated:   {}", report.migrated);
    println!("  up to date: {}", report.skipped);
    println!("  unreadable: {}", report.failed);
    println!("  conflicted: {}", report.conflicted);

    if report.conflicted > 0 {
        println!();
        println!("Some records changed during migration; run again to pick them up.");
    }
    Ok(())
}
