//! chive: moves aged records from a live document store to cold object
//! storage.

use anyhow::{Context, Result};
use archiver::Archiver;
use clap::Parser;
use common::cli::utils::{handle_common_command, init_logging, load_config};
use common::cli::{CommonArgs, CommonCommands};

#[derive(Parser, Debug)]
#[command(name = "chive", author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<CommonCommands>,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = load_config(cli.common.config.as_ref())?;
    let command = cli.command.unwrap_or_default();
    if handle_common_command(&command, &config)? {
        return Ok(());
    }

    config.validate().context("Invalid configuration")?;

    log::info!("Starting chive archiver for {}", config.source.identity());
    let archiver = Archiver::from_config(&config)
        .await
        .context("Failed to initialize archiver")?;

    archiver
        .run(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                log::error!("Shutdown signal handler failed: {e:#}");
            }
        })
        .await;

    log::info!("chive stopped");
    Ok(())
}
