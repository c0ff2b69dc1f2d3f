//! platnet Platform Agent
//!
//! Runs the platform drivers for one platform network and publishes their
//! events as structured log records.
//!
//! ## Architecture
//!
//! - **Backend**: chosen by endpoint scheme (`mock://` runs the simulator)
//! - **Drivers**: one per platform in the resolved topology
//! - **Publisher**: drains the bounded event channel and logs each event

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use platnet_agent::{backend_for, Config, PlatformAgent};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        platform_id = %config.platform_id,
        endpoint = %config.endpoint,
        topology_file = ?config.topology_file,
        "Starting platnet platform agent"
    );

    let backend = backend_for(&config)?;
    let agent = PlatformAgent::start(&config, backend).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    agent.shutdown().await;
    info!("Platform agent shutdown complete");
    Ok(())
}
