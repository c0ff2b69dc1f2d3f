//! Platform network backend interface.
//!
//! A backend is the opaque capability a driver uses to reach the platform
//! network: an OMS connection, a serial multiplexer, or the in-process
//! simulator. One backend instance may serve every driver in a network, so
//! each call names the platform it is about.
//!
//! Drivers bound every backend call with their configured timeout; backends
//! do not need to enforce one themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use platnet_events::{AlarmInstance, AlarmType, AttributeSample, AttributeValue, NtpTimestamp};
use platnet_id::{AttributeId, PlatformId, PortId};
use serde::{Deserialize, Serialize};

use crate::error::{AttributeError, DriverError, Result};
use crate::topology::Topology;

/// Liveness acknowledgment returned by `ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong;

impl fmt::Display for Pong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PONG")
    }
}

/// Description of one platform attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub attr_id: AttributeId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,

    pub writable: bool,

    /// Suggested monitoring period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_rate_ms: Option<u64>,
}

/// Descriptive metadata of a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformMetadata {
    pub platform_id: PlatformId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_type: Option<String>,

    #[serde(default)]
    pub attributes: Vec<AttributeDefinition>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Power state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    On,
    Off,
}

/// Port configuration: attribute name to value.
pub type PortConfig = serde_json::Map<String, serde_json::Value>;

/// Description of one platform port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port_id: PortId,
    pub state: PortState,

    #[serde(default)]
    pub config: PortConfig,
}

/// Per-attribute result of a read: samples ascending by timestamp.
pub type AttributeReadings = BTreeMap<AttributeId, Result<Vec<AttributeSample>, AttributeError>>;

/// Per-attribute result of a write: the value and time the backend recorded.
pub type AttributeWrites = BTreeMap<AttributeId, Result<AttributeSample, AttributeError>>;

/// Backend-specific alarm dispatch parameters.
pub type AlarmDispatchParams = serde_json::Value;

/// Handle of an alarm subscription held by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmSubscription {
    pub subscription_id: String,
    pub platform_id: PlatformId,
    pub params: AlarmDispatchParams,
}

/// One alarm reported by the platform network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub timestamp: NtpTimestamp,
    pub alarm_type: AlarmType,
    pub instance: AlarmInstance,
}

/// Platform network backend.
#[async_trait]
pub trait PlatformBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Verifies the platform network is reachable.
    async fn ping(&self) -> Result<Pong>;

    /// Backend-specific activation handshake for `platform_id`.
    async fn activate(&self, platform_id: &PlatformId) -> Result<()>;

    /// Discovers the topology rooted at `root`.
    async fn discover_topology(&self, root: &PlatformId) -> Result<Topology>;

    async fn get_metadata(&self, platform_id: &PlatformId) -> Result<PlatformMetadata>;

    /// Reads samples with timestamp >= `since`. Unknown attributes are
    /// reported per key.
    async fn get_attribute_values(
        &self,
        platform_id: &PlatformId,
        attr_ids: &[AttributeId],
        since: NtpTimestamp,
    ) -> Result<AttributeReadings>;

    /// Writes attribute values, echoing what was actually recorded.
    async fn set_attribute_values(
        &self,
        platform_id: &PlatformId,
        assignments: &[(AttributeId, AttributeValue)],
    ) -> Result<AttributeWrites>;

    async fn get_ports(&self, platform_id: &PlatformId) -> Result<Vec<PortInfo>>;

    /// Configures a port, returning its resulting configuration.
    async fn set_up_port(
        &self,
        platform_id: &PlatformId,
        port_id: &PortId,
        attributes: &PortConfig,
    ) -> Result<PortConfig>;

    /// Registers interest in alarms for `platform_id`.
    async fn subscribe_alarms(
        &self,
        platform_id: &PlatformId,
        params: &AlarmDispatchParams,
    ) -> Result<AlarmSubscription>;

    /// Returns alarms raised at or after `since`.
    async fn fetch_alarms(
        &self,
        subscription: &AlarmSubscription,
        since: NtpTimestamp,
    ) -> Result<Vec<AlarmRecord>>;

    async fn unsubscribe_alarms(&self, subscription: &AlarmSubscription) -> Result<()>;
}

/// Runs a backend call, failing with [`DriverError::Timeout`] if it does not
/// complete within `timeout`.
pub(crate) async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout { operation, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded("ping", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Pong)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, DriverError::Timeout { operation: "ping", .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let pong = bounded("ping", Duration::from_secs(1), async { Ok(Pong) })
            .await
            .unwrap();
        assert_eq!(pong.to_string(), "PONG");

        let err = bounded::<Pong>("ping", Duration::from_secs(1), async {
            Err(DriverError::Connection("refused".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err, DriverError::Connection("refused".into()));
    }

    #[test]
    fn test_port_info_json() {
        let info: PortInfo = serde_json::from_str(
            r#"{"port_id":"Node1D_port_1","state":"off","config":{"networks":["n1"]}}"#,
        )
        .unwrap();
        assert_eq!(info.state, PortState::Off);
        assert_eq!(info.config["networks"][0], "n1");
    }
}
