//! Configuration for the platform agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use platnet_driver::{DriverConfig, MonitoredAttribute};
use platnet_id::{AttributeId, PlatformId};

/// Platform agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root platform of the network this agent supervises.
    pub platform_id: PlatformId,

    /// Platform network endpoint, e.g. `mock://local`.
    pub endpoint: String,

    /// Backend call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Resource monitoring period in milliseconds.
    pub polling_interval_ms: u64,

    /// Attributes to monitor; empty means everything the platform reports.
    pub monitored_attributes: Vec<AttributeId>,

    /// TOML topology file. Without one the topology is discovered.
    pub topology_file: Option<PathBuf>,

    /// Capacity of the event forwarding channel.
    pub event_buffer: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let platform_id = lookup("PLATNET_PLATFORM_ID")
            .unwrap_or_else(|| "Node1D".to_string())
            .parse::<PlatformId>()
            .context("invalid PLATNET_PLATFORM_ID")?;

        let endpoint = lookup("PLATNET_ENDPOINT").unwrap_or_else(|| "mock://local".to_string());

        let timeout_ms = parse_or(&lookup, "PLATNET_TIMEOUT_MS", 5_000)?;
        let polling_interval_ms = parse_or(&lookup, "PLATNET_POLLING_INTERVAL_MS", 5_000)?;
        let event_buffer = parse_or(&lookup, "PLATNET_EVENT_BUFFER", 1_024)?;

        let monitored_attributes = lookup("PLATNET_MONITORED_ATTRIBUTES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse::<AttributeId>())
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .context("invalid PLATNET_MONITORED_ATTRIBUTES")?
            .unwrap_or_default();

        let topology_file = lookup("PLATNET_TOPOLOGY_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let log_level = lookup("PLATNET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            platform_id,
            endpoint,
            timeout_ms,
            polling_interval_ms,
            monitored_attributes,
            topology_file,
            event_buffer,
            log_level,
        })
    }

    /// Driver configuration shared by every platform in the network.
    pub fn driver_config(&self) -> Result<DriverConfig> {
        let config = self.monitored_attributes.iter().fold(
            DriverConfig::new(self.endpoint.clone())
                .with_timeout(Duration::from_millis(self.timeout_ms))
                .with_polling_interval(Duration::from_millis(self.polling_interval_ms)),
            |config, attr_id| config.with_monitored_attribute(MonitoredAttribute::new(attr_id.clone())),
        );
        config.validate().context("invalid driver configuration")?;
        Ok(config)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {value:?}")),
        None => Ok(default),
    }
}
