use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use at_driver::cli::Cli;
use at_driver::config::Config;
use at_driver::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = Config::try_from(cli).context("invalid configuration")?;
    info!(
        listen_addr = %config.listen_addr,
        platform = %config.platform,
        voice_endpoint = %config.voice_endpoint,
        "starting at-driver"
    );

    at_driver::run(config, Some(telemetry.metrics_handle())).await
}
