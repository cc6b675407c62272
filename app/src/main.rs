mod background_service;
mod cli;
mod config;
mod infrastructure;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use domain::model::vo::QueueError;
use tracing_subscriber::EnvFilter;

use self::background_service::prelude::*;
use self::cli::{Cli, Commands};
use self::config::build_config;
use self::infrastructure::ioc::Container;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_config(&cli.config).with_context(|| "Failed to build config".red())?;
    let container = Container::new(&config)
        .await
        .with_context(|| "Cannot build IOC container".red())?;

    let passes = match cli.command {
        Commands::Run { passes } => passes,
        command => return cli::execute(&container, command).await,
    };

    let manager = QueueManager::new(&container, config.poll_interval());
    tokio::select! {
        result = manager.run(passes) => match result {
            Ok(()) => tracing::info!("Queue manager finished"),
            Err(e @ QueueError::SwitchOff) => {
                tracing::error!("Queue manager stopped: {e}. Switch it on with `hrmd switch on`.");
                return Err(e).with_context(|| "Queue manager stopped".red());
            }
            Err(e) => return Err(e).with_context(|| "Queue manager failed".red()),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Stopping queue manager (ctrl-c handling).");
        }
    }
    Ok(())
}
