//! # Beacon
//!
//! Real-time telemetry broadcast gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Run with beacon.toml from the working directory or /etc/beacon
//! beacon
//!
//! # Run with a specific config file
//! BEACON_CONFIG=/path/to/beacon.toml beacon
//!
//! # Override individual settings
//! BEACON__PORT=9000 BEACON__AUTH__REQUIRED=false beacon
//! ```

use anyhow::Result;
use beacon_server::config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Beacon on {}:{}", config.host, config.port);

    beacon_server::run(config).await
}
