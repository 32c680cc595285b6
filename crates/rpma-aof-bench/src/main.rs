#![warn(missing_docs)]

//! rpma-aof: drive the append-only write+flush protocol over a loopback fabric.

mod cli;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    match &cli.command {
        Command::ShowConfig => {
            print!("{}", config.to_toml()?);
        }
        Command::Run { .. } => {
            let Some(shape) = cli.workload() else {
                return Ok(());
            };
            info!(
                engine = config.engine.name(),
                block_size = shape.block_size,
                total = shape.total_bytes,
                "starting append workload"
            );
            let report = workload::run(&config, &shape).await?;
            print!(
                "{}",
                toml::to_string_pretty(&report).context("rendering report")?
            );
        }
    }

    Ok(())
}
