use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_server::config::RelayConfig;
use relay_server::server::{Backends, Server};

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (RELAY_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("RELAY_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("relay_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = RelayConfig::parse();
    config.validate().context("invalid configuration")?;
    tracing::info!("Starting relay node on {}", config.listen_addr);
    if config.redis_url.is_none() {
        tracing::info!("Running standalone: presence and broker are in-process");
    }

    let backends = Backends::connect(&config).await?;
    Server::new(config, backends).run().await
}
