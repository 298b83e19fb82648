//! Casino ledger daemon
//!
//! Opens the ledger, follows the runtime config file and runs the lottery
//! draw scheduler until interrupted.

use casino_ledger::{AppConfig, ConfigLoader, LedgerMetrics, Platform};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// Casino ledger CLI
#[derive(Parser)]
#[command(name = "casino-ledger")]
#[command(about = "Wallet ledger and game/lottery settlement engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory, overrides the config file
    #[arg(short, long)]
    data_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lottery scheduler until Ctrl+C
    Run,

    /// Run one lottery automation pass and exit
    Tick,

    /// Write the default configuration to a file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "casino-ledger.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "casino_ledger=debug"
    } else {
        "casino_ledger=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };

    if let Commands::InitConfig { output } = &cli.command {
        loader.save(&AppConfig::default(), &output.to_string_lossy())?;
        tracing::info!(path = %output.display(), "Default configuration written");
        return Ok(());
    }

    let mut config = loader.load()?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_directory = dir;
    }

    let platform = Platform::open(config)?;

    match cli.command {
        Commands::Run => run(platform).await,
        Commands::Tick => {
            let report = platform.run_lottery_tick()?;
            tracing::info!(
                recovered = report.recovered.len(),
                promoted = report.promoted.len(),
                created = report.created.len(),
                "Lottery tick complete"
            );
            Ok(())
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn run(platform: Platform) -> Result<(), Box<dyn std::error::Error>> {
    // Dropping the watcher stops hot reload, so it lives for the whole run.
    let _watcher = match &platform.config().runtime_config_path {
        Some(path) => match platform.runtime().watch(path) {
            Ok(watcher) => {
                tracing::info!(path = %path, "Watching runtime config");
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Runtime config hot reload disabled");
                None
            }
        },
        None => None,
    };

    let scheduler = platform.start_scheduler();
    tracing::info!("Casino ledger running, press Ctrl+C to stop");

    shutdown_signal().await;

    scheduler.shutdown().await;
    let metrics = platform.metrics();
    tracing::info!(
        bets_settled = LedgerMetrics::get(&metrics.bets_settled_total),
        draws_completed = LedgerMetrics::get(&metrics.draws_completed_total),
        uptime_secs = metrics.uptime_secs(),
        "Shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal");
        },
    }
}
