//! Driver configuration.

use std::time::Duration;

use platnet_id::AttributeId;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_polling_interval_ms() -> u64 {
    5_000
}

fn default_alarm_poll_interval_ms() -> u64 {
    1_000
}

fn default_connection_lost_threshold() -> u32 {
    3
}

/// An attribute the resource monitor polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredAttribute {
    pub attr_id: AttributeId,

    /// Polling period for this attribute. Defaults to the driver's polling
    /// interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_rate_ms: Option<u64>,
}

impl MonitoredAttribute {
    pub fn new(attr_id: AttributeId) -> Self {
        Self {
            attr_id,
            monitor_rate_ms: None,
        }
    }

    pub fn with_rate(attr_id: AttributeId, rate: Duration) -> Self {
        Self {
            attr_id,
            monitor_rate_ms: Some(rate.as_millis() as u64),
        }
    }
}

/// Platform driver configuration.
///
/// Immutable once handed to a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Platform network endpoint, e.g. `mock://local` or `http://oms:9021`.
    pub endpoint: String,

    /// Upper bound on every backend call, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Default resource monitoring period, in milliseconds.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Alarm dispatch polling period, in milliseconds.
    #[serde(default = "default_alarm_poll_interval_ms")]
    pub alarm_poll_interval_ms: u64,

    /// Consecutive failed polls before a communication-lost alarm is raised.
    #[serde(default = "default_connection_lost_threshold")]
    pub connection_lost_threshold: u32,

    #[serde(default)]
    pub monitored_attributes: Vec<MonitoredAttribute>,

    /// Backend-specific options.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl DriverConfig {
    /// Creates a configuration with defaults for everything but the endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_ms: default_timeout_ms(),
            polling_interval_ms: default_polling_interval_ms(),
            alarm_poll_interval_ms: default_alarm_poll_interval_ms(),
            connection_lost_threshold: default_connection_lost_threshold(),
            monitored_attributes: Vec::new(),
            options: serde_json::Map::new(),
        }
    }

    /// Parses a configuration from a JSON value.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let config: Self =
            serde_json::from_value(value).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_alarm_poll_interval(mut self, interval: Duration) -> Self {
        self.alarm_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_connection_lost_threshold(mut self, threshold: u32) -> Self {
        self.connection_lost_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_monitored_attribute(mut self, attribute: MonitoredAttribute) -> Self {
        self.monitored_attributes.push(attribute);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn alarm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.alarm_poll_interval_ms)
    }

    /// The scheme part of the endpoint (`mock` for `mock://local`).
    pub fn scheme(&self) -> Option<&str> {
        self.endpoint
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .filter(|scheme| !scheme.is_empty())
    }

    /// Effective polling period of a monitored attribute.
    pub fn monitor_rate(&self, attribute: &MonitoredAttribute) -> Duration {
        attribute
            .monitor_rate_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.polling_interval())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheme().is_none() {
            return Err(DriverError::Config(format!(
                "endpoint {:?} must have the form scheme://address",
                self.endpoint
            )));
        }

        for (name, value) in [
            ("timeout_ms", self.timeout_ms),
            ("polling_interval_ms", self.polling_interval_ms),
            ("alarm_poll_interval_ms", self.alarm_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(DriverError::Config(format!("{name} must be positive")));
            }
        }

        if self.connection_lost_threshold == 0 {
            return Err(DriverError::Config(
                "connection_lost_threshold must be at least 1".to_string(),
            ));
        }

        for attribute in &self.monitored_attributes {
            if attribute.monitor_rate_ms == Some(0) {
                return Err(DriverError::Config(format!(
                    "monitor_rate_ms for {} must be positive",
                    attribute.attr_id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_json() {
        let config = DriverConfig::from_json(json!({
            "endpoint": "mock://x",
            "timeout_ms": 500
        }))
        .unwrap();

        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.polling_interval(), Duration::from_secs(5));
        assert_eq!(config.connection_lost_threshold, 3);
        assert_eq!(config.scheme(), Some("mock"));
        assert!(config.monitored_attributes.is_empty());
    }

    #[test]
    fn test_monitored_attributes_from_json() {
        let config = DriverConfig::from_json(json!({
            "endpoint": "mock://x",
            "polling_interval_ms": 2000,
            "monitored_attributes": [
                { "attr_id": "input_voltage" },
                { "attr_id": "input_bus_current", "monitor_rate_ms": 500 }
            ],
            "options": { "network": "single" }
        }))
        .unwrap();

        let rates: Vec<_> = config
            .monitored_attributes
            .iter()
            .map(|a| config.monitor_rate(a))
            .collect();
        assert_eq!(rates, vec![Duration::from_secs(2), Duration::from_millis(500)]);
        assert_eq!(config.options["network"], "single");
    }

    #[test]
    fn test_rejects_endpoint_without_scheme() {
        let err = DriverConfig::new("localhost:9021").validate().unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
        assert!(DriverConfig::new("://x").validate().is_err());
    }

    #[test]
    fn test_rejects_zero_durations() {
        assert!(DriverConfig::new("mock://x")
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(DriverConfig::new("mock://x")
            .with_connection_lost_threshold(0)
            .validate()
            .is_err());

        let attr = MonitoredAttribute::with_rate("temp".parse().unwrap(), Duration::ZERO);
        assert!(DriverConfig::new("mock://x")
            .with_monitored_attribute(attr)
            .validate()
            .is_err());
    }

    #[test]
    fn test_rejects_invalid_attribute_id() {
        let result = DriverConfig::from_json(json!({
            "endpoint": "mock://x",
            "monitored_attributes": [{ "attr_id": "bad id" }]
        }));
        assert!(matches!(result, Err(DriverError::Config(_))));
    }
}
