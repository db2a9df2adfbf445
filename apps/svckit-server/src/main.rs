use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use svckit_bootstrap::{AppConfig, CliArgs};

use std::path::PathBuf;

mod registered_modules;

// Keep sqlx drivers linked (sqlx::any quirk)
#[allow(unused_imports)]
use sqlx::{postgres::Postgres, sqlite::Sqlite};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use svckit::runner::{run, RunOptions, ShutdownOptions};

#[allow(dead_code)]
fn _ensure_drivers_linked() {
    // Ensure database drivers are linked for sqlx::any
    let _ = std::any::type_name::<Sqlite>();
    let _ = std::any::type_name::<Postgres>();
}

/// Svckit Server - host for client and api modules
#[derive(Parser)]
#[command(name = "svckit-server")]
#[command(about = "Svckit Server - host for client and api modules")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Profile override (selects the `layout_{profile}.html` shell template)
    #[arg(long)]
    profile: Option<String>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use an in-memory database (sqlite::memory:)
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and registrations, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    _ensure_drivers_linked();

    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        profile: cli.profile.clone(),
        print_config: cli.print_config,
        verbose: cli.verbose,
        mock: cli.mock,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (APP__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    svckit_bootstrap::init_logging(&logging_config, &config.base_dir());

    tracing::info!(profile = %config.server.profile, "Svckit Server starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config),
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    tracing::info!(
        clients = config.clients.len(),
        apis = config.apis.len(),
        database = config.database.is_some(),
        "Initializing modules…"
    );

    run(RunOptions {
        config,
        shutdown: ShutdownOptions::Signals,
    })
    .await
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    config.validate()?;
    let registry = svckit::Registry::discover()?;

    for family in [svckit::Family::Client, svckit::Family::Api] {
        for entry in registry.modules(family) {
            let configured = match family {
                svckit::Family::Client => config.clients.contains_key(entry.name),
                svckit::Family::Api => config.apis.contains_key(entry.name),
            };
            anyhow::ensure!(configured, "{family} module '{}' has no server configuration", entry.name);
        }
    }

    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}
