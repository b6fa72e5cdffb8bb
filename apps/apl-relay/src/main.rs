use anyhow::Result;
use apl_relay::{config::Cli, server, telemetry::Telemetry, RelayConfig};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = ?config.metrics_addr,
        "starting apl-relay"
    );

    server::run(config, telemetry.metrics_handle()).await
}
