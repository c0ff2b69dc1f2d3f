//! The platform driver.
//!
//! A [`PlatformDriver`] represents one platform in the network. The
//! supervising agent constructs it, hands it a topology, activates it and
//! then issues queries and commands. Attribute samples and alarms are pushed
//! to the registered [`EventListener`] from background tasks.
//!
//! Lifecycle:
//!
//! ```text
//! Constructed --set_topology--> TopologySet --go_active--> Active
//!      |                                                     ^
//!      +------------------------go_active--------------------+
//!  any state --destroy--> Destroyed
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use platnet_events::{AttributeValue, NtpTimestamp};
use platnet_id::{AttributeId, PlatformId, PortId};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::alarm::{AlarmDispatch, AlarmPoller};
use crate::backend::{
    bounded, AlarmDispatchParams, AttributeReadings, AttributeWrites, PlatformBackend,
    PlatformMetadata, PortConfig, PortInfo, Pong,
};
use crate::config::DriverConfig;
use crate::error::{AttributeError, DriverError, Result};
use crate::monitor::{attributes_from_metadata, rate_groups, HighWaterMarks, ResourceMonitor};
use crate::notify::{DiagnosticsSnapshot, EventListener, EventNotifier};
use crate::tasks::TaskGroup;
use crate::topology::{DeviceMap, PlatformNode, StreamConfigMap, Topology};

/// Lifecycle state of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Constructed,
    TopologySet,
    Active,
    Destroyed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverState::Constructed => "constructed",
            DriverState::TopologySet => "topology_set",
            DriverState::Active => "active",
            DriverState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct TopologyAssignment {
    topology: Topology,
    devices: Option<DeviceMap>,
    streams: Option<StreamConfigMap>,
}

#[derive(Debug)]
struct Lifecycle {
    state: DriverState,
    assignment: Option<TopologyAssignment>,
}

/// Driver for one platform of the network.
pub struct PlatformDriver {
    platform_id: PlatformId,
    parent_platform_id: Option<PlatformId>,
    config: DriverConfig,
    backend: Arc<dyn PlatformBackend>,
    notifier: Arc<EventNotifier>,
    lifecycle: Mutex<Lifecycle>,
    node: OnceLock<PlatformNode>,
    high_water: HighWaterMarks,
    monitoring: tokio::sync::Mutex<Option<TaskGroup>>,
    alarm_dispatch: tokio::sync::Mutex<Option<AlarmDispatch>>,
}

impl PlatformDriver {
    /// Creates a driver in the `Constructed` state.
    ///
    /// Fails with [`DriverError::Config`] if `config` is invalid.
    pub fn new(
        platform_id: PlatformId,
        config: DriverConfig,
        parent_platform_id: Option<PlatformId>,
        backend: Arc<dyn PlatformBackend>,
    ) -> Result<Self> {
        config.validate()?;

        debug!(
            platform_id = %platform_id,
            parent_platform_id = ?parent_platform_id.as_ref().map(PlatformId::as_str),
            backend = backend.name(),
            endpoint = %config.endpoint,
            "Platform driver created"
        );

        Ok(Self {
            notifier: Arc::new(EventNotifier::new(platform_id.clone())),
            platform_id,
            parent_platform_id,
            config,
            backend,
            lifecycle: Mutex::new(Lifecycle {
                state: DriverState::Constructed,
                assignment: None,
            }),
            node: OnceLock::new(),
            high_water: HighWaterMarks::default(),
            monitoring: tokio::sync::Mutex::new(None),
            alarm_dispatch: tokio::sync::Mutex::new(None),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn platform_id(&self) -> &PlatformId {
        &self.platform_id
    }

    pub fn parent_platform_id(&self) -> Option<&PlatformId> {
        self.parent_platform_id.as_ref()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn state(&self) -> DriverState {
        self.lifecycle().state
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitoring.lock().await.is_some()
    }

    pub async fn is_dispatching_alarms(&self) -> bool {
        self.alarm_dispatch.lock().await.is_some()
    }

    /// Snapshot of event delivery and background poll counters.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.notifier.snapshot()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_not_destroyed(&self) -> Result<()> {
        match self.state() {
            DriverState::Destroyed => Err(DriverError::destroyed()),
            _ => Ok(()),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            DriverState::Active => Ok(()),
            DriverState::Destroyed => Err(DriverError::destroyed()),
            DriverState::Constructed | DriverState::TopologySet => {
                Err(DriverError::activation_required())
            }
        }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        bounded(operation, self.config.timeout(), call).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Assigns the network topology, with optional device and stream
    /// configuration maps. Allowed once, before activation.
    pub fn set_topology(
        &self,
        topology: Topology,
        devices: Option<DeviceMap>,
        streams: Option<StreamConfigMap>,
    ) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            DriverState::Constructed => {}
            DriverState::TopologySet => {
                return Err(DriverError::InvalidState(
                    "topology has already been set".to_string(),
                ))
            }
            DriverState::Active => {
                return Err(DriverError::InvalidState(
                    "topology cannot change after activation".to_string(),
                ))
            }
            DriverState::Destroyed => return Err(DriverError::destroyed()),
        }

        debug!(
            platform_id = %self.platform_id,
            platforms = topology.platform_ids().len(),
            "Topology set"
        );
        lifecycle.assignment = Some(TopologyAssignment {
            topology,
            devices,
            streams,
        });
        lifecycle.state = DriverState::TopologySet;
        Ok(())
    }

    /// Registers the receiver of this driver's events, replacing any
    /// previous one. Allowed in any state.
    pub fn set_event_listener<L>(&self, listener: L)
    where
        L: EventListener + 'static,
    {
        self.notifier.set_listener(Arc::new(listener));
    }

    /// Activates the driver and resolves its node tree.
    ///
    /// Uses the assigned topology, or asks the backend to discover one if
    /// none was set.
    pub async fn go_active(&self) -> Result<()> {
        let assignment = {
            let lifecycle = self.lifecycle();
            match lifecycle.state {
                DriverState::Active => {
                    return Err(DriverError::InvalidState("driver is already active".to_string()))
                }
                DriverState::Destroyed => return Err(DriverError::destroyed()),
                DriverState::Constructed | DriverState::TopologySet => {
                    lifecycle.assignment.clone()
                }
            }
        };

        info!(platform_id = %self.platform_id, backend = self.backend.name(), "Activating platform driver");
        self.call("activate", self.backend.activate(&self.platform_id))
            .await?;

        let node = match assignment {
            Some(a) => a
                .topology
                .resolve(&self.platform_id, a.devices.as_ref(), a.streams.as_ref())?,
            None => {
                let topology = self
                    .call(
                        "discover_topology",
                        self.backend.discover_topology(&self.platform_id),
                    )
                    .await?;
                topology.resolve(&self.platform_id, None, None)?
            }
        };
        let subplatforms = node.subplatforms().len();

        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                DriverState::Destroyed => return Err(DriverError::destroyed()),
                DriverState::Active => {
                    return Err(DriverError::InvalidState("driver is already active".to_string()))
                }
                DriverState::Constructed | DriverState::TopologySet => {}
            }
            if self.node.set(node).is_err() {
                return Err(DriverError::InvalidState("driver is already active".to_string()));
            }
            lifecycle.state = DriverState::Active;
        }

        info!(platform_id = %self.platform_id, subplatforms, "Platform driver active");
        Ok(())
    }

    /// Stops background activity and releases the driver. Never fails and
    /// may be repeated; later operations fail with `InvalidState`.
    pub async fn destroy(&self) {
        self.stop_resource_monitoring().await;
        self.stop_alarm_dispatch().await;

        let previous = {
            let mut lifecycle = self.lifecycle();
            std::mem::replace(&mut lifecycle.state, DriverState::Destroyed)
        };

        // Starts re-check the state under their task lock, so only one that
        // won its lock before the state change can have spawned since.
        self.stop_resource_monitoring().await;
        self.stop_alarm_dispatch().await;

        if previous != DriverState::Destroyed {
            info!(
                platform_id = %self.platform_id,
                previous_state = %previous,
                "Platform driver destroyed"
            );
        }
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// The resolved node tree rooted at this platform.
    pub fn node(&self) -> Result<&PlatformNode> {
        self.node.get().ok_or_else(DriverError::activation_required)
    }

    /// Ids of the direct subplatforms.
    pub fn get_subplatform_ids(&self) -> Result<BTreeSet<PlatformId>> {
        self.node().map(PlatformNode::subplatform_ids)
    }

    // =========================================================================
    // Queries and commands
    // =========================================================================

    /// Checks that the platform network is reachable.
    pub async fn ping(&self) -> Result<Pong> {
        self.ensure_not_destroyed()?;
        self.call("ping", self.backend.ping()).await
    }

    pub async fn get_metadata(&self) -> Result<PlatformMetadata> {
        self.ensure_not_destroyed()?;
        self.call("get_metadata", self.backend.get_metadata(&self.platform_id))
            .await
    }

    /// Reads samples of `attr_ids` taken at or after `since`.
    ///
    /// Every requested id has an entry in the result; samples are ascending.
    pub async fn get_attribute_values(
        &self,
        attr_ids: &[AttributeId],
        since: NtpTimestamp,
    ) -> Result<AttributeReadings> {
        self.ensure_active()?;
        let mut readings = self
            .call(
                "get_attribute_values",
                self.backend
                    .get_attribute_values(&self.platform_id, attr_ids, since),
            )
            .await?;

        let mut result = AttributeReadings::new();
        for attr_id in attr_ids {
            if result.contains_key(attr_id) {
                continue;
            }
            let entry = match readings.remove(attr_id) {
                Some(Ok(mut samples)) => {
                    samples.retain(|s| s.timestamp >= since);
                    samples.sort_by_key(|s| s.timestamp);
                    Ok(samples)
                }
                Some(Err(e)) => Err(e),
                None => {
                    warn!(
                        platform_id = %self.platform_id,
                        attr_id = %attr_id,
                        "Backend omitted requested attribute"
                    );
                    Err(AttributeError::Unknown)
                }
            };
            result.insert(attr_id.clone(), entry);
        }
        Ok(result)
    }

    /// Writes attribute values, returning what the platform recorded for
    /// each one.
    pub async fn set_attribute_values(
        &self,
        assignments: &[(AttributeId, AttributeValue)],
    ) -> Result<AttributeWrites> {
        self.ensure_active()?;
        let mut writes = self
            .call(
                "set_attribute_values",
                self.backend
                    .set_attribute_values(&self.platform_id, assignments),
            )
            .await?;

        let mut result = AttributeWrites::new();
        for (attr_id, _) in assignments {
            if result.contains_key(attr_id) {
                continue;
            }
            let entry = writes.remove(attr_id).unwrap_or(Err(AttributeError::Unknown));
            if let Err(e) = &entry {
                debug!(platform_id = %self.platform_id, attr_id = %attr_id, error = %e, "Attribute write rejected");
            }
            result.insert(attr_id.clone(), entry);
        }

        info!(
            platform_id = %self.platform_id,
            attributes = assignments.len(),
            rejected = result.values().filter(|r| r.is_err()).count(),
            "Attribute values set"
        );
        Ok(result)
    }

    pub async fn get_ports(&self) -> Result<Vec<PortInfo>> {
        self.ensure_active()?;
        self.call("get_ports", self.backend.get_ports(&self.platform_id))
            .await
    }

    /// Configures a port and returns its resulting configuration.
    pub async fn set_up_port(&self, port_id: &PortId, attributes: &PortConfig) -> Result<PortConfig> {
        self.ensure_active()?;
        let config = self
            .call(
                "set_up_port",
                self.backend
                    .set_up_port(&self.platform_id, port_id, attributes),
            )
            .await?;

        info!(platform_id = %self.platform_id, port_id = %port_id, "Port set up");
        Ok(config)
    }

    // =========================================================================
    // Resource monitoring
    // =========================================================================

    /// Starts polling the monitored attributes. A no-op if already running.
    ///
    /// Attributes come from the configuration, or from the platform metadata
    /// when the configuration names none.
    pub async fn start_resource_monitoring(&self) -> Result<()> {
        self.ensure_active()?;

        let mut monitoring = self.monitoring.lock().await;
        self.ensure_active()?;
        if monitoring.is_some() {
            debug!(platform_id = %self.platform_id, "Resource monitoring already running");
            return Ok(());
        }

        let attributes = if self.config.monitored_attributes.is_empty() {
            let metadata = self
                .call("get_metadata", self.backend.get_metadata(&self.platform_id))
                .await?;
            attributes_from_metadata(&metadata)
        } else {
            self.config.monitored_attributes.clone()
        };

        let groups = rate_groups(&self.config, &attributes);
        if groups.is_empty() {
            warn!(platform_id = %self.platform_id, "No attributes to monitor");
        }

        let monitor = ResourceMonitor::new(
            self.platform_id.clone(),
            &self.config,
            Arc::clone(&self.backend),
            Arc::clone(&self.notifier),
            Arc::clone(&self.high_water),
        );
        let tasks = monitor.spawn(groups);

        info!(
            platform_id = %self.platform_id,
            attributes = attributes.len(),
            rate_groups = tasks.len(),
            listener = self.notifier.has_listener(),
            "Resource monitoring started"
        );
        *monitoring = Some(tasks);
        Ok(())
    }

    /// Stops resource monitoring. Returns once the polling tasks have exited;
    /// no attribute event is delivered afterwards.
    pub async fn stop_resource_monitoring(&self) {
        let mut monitoring = self.monitoring.lock().await;
        if let Some(tasks) = monitoring.take() {
            tasks.stop().await;
            info!(platform_id = %self.platform_id, "Resource monitoring stopped");
        }
    }

    // =========================================================================
    // Alarm dispatch
    // =========================================================================

    /// Subscribes to platform alarms and starts relaying them. A no-op if
    /// already running.
    pub async fn start_alarm_dispatch(&self, params: AlarmDispatchParams) -> Result<()> {
        self.ensure_active()?;

        let mut dispatch = self.alarm_dispatch.lock().await;
        self.ensure_active()?;
        if dispatch.is_some() {
            debug!(platform_id = %self.platform_id, "Alarm dispatch already running");
            return Ok(());
        }

        let since = NtpTimestamp::now();
        let subscription = self
            .call(
                "subscribe_alarms",
                self.backend.subscribe_alarms(&self.platform_id, &params),
            )
            .await?;

        info!(
            platform_id = %self.platform_id,
            subscription_id = %subscription.subscription_id,
            "Alarm dispatch started"
        );

        let poller = AlarmPoller::new(
            self.platform_id.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.notifier),
            self.config.timeout(),
            self.config.alarm_poll_interval(),
            subscription,
            since,
        );
        *dispatch = Some(poller.spawn());
        Ok(())
    }

    /// Stops alarm dispatch and drops the backend subscription. Returns once
    /// the polling task has exited; no alarm event is delivered afterwards.
    pub async fn stop_alarm_dispatch(&self) {
        let mut dispatch = self.alarm_dispatch.lock().await;
        let Some(AlarmDispatch { subscription, tasks }) = dispatch.take() else {
            return;
        };

        tasks.stop().await;

        if let Err(e) = self
            .call("unsubscribe_alarms", self.backend.unsubscribe_alarms(&subscription))
            .await
        {
            error!(
                platform_id = %self.platform_id,
                subscription_id = %subscription.subscription_id,
                error = %e,
                "Failed to release alarm subscription"
            );
        }

        info!(platform_id = %self.platform_id, "Alarm dispatch stopped");
    }
}

impl fmt::Debug for PlatformDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformDriver")
            .field("platform_id", &self.platform_id)
            .field("parent_platform_id", &self.parent_platform_id)
            .field("backend", &self.backend.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatorBackend;
    use rstest::rstest;

    fn pid(s: &str) -> PlatformId {
        s.parse().unwrap()
    }

    fn driver() -> PlatformDriver {
        let sim = SimulatorBackend::new();
        sim.add_platform(pid("P1"), [pid("P1a"), pid("P1b")]);
        PlatformDriver::new(
            pid("P1"),
            DriverConfig::new("mock://x"),
            None,
            Arc::new(sim),
        )
        .unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let err = PlatformDriver::new(
            pid("P1"),
            DriverConfig::new("no-scheme"),
            None,
            Arc::new(SimulatorBackend::new()),
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn test_set_topology_once() {
        let driver = driver();
        let topology = Topology::new().with_platform(pid("P1"), vec![]);

        driver.set_topology(topology.clone(), None, None).unwrap();
        assert_eq!(driver.state(), DriverState::TopologySet);

        let err = driver.set_topology(topology, None, None).unwrap_err();
        assert!(matches!(err, DriverError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_go_active_discovers_topology() {
        let driver = driver();
        driver.go_active().await.unwrap();

        assert_eq!(driver.state(), DriverState::Active);
        assert_eq!(
            driver.get_subplatform_ids().unwrap(),
            BTreeSet::from([pid("P1a"), pid("P1b")])
        );
    }

    #[tokio::test]
    async fn test_go_active_twice_fails() {
        let driver = driver();
        driver.go_active().await.unwrap();
        let err = driver.go_active().await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidState(_)));
    }

    #[rstest]
    #[case::constructed(false)]
    #[case::destroyed(true)]
    #[tokio::test]
    async fn test_active_only_operations(#[case] destroyed: bool) {
        let driver = driver();
        if destroyed {
            driver.destroy().await;
        }

        let err = driver.get_ports().await.unwrap_err();
        if destroyed {
            assert!(matches!(err, DriverError::InvalidState(_)));
        } else {
            assert!(matches!(err, DriverError::Precondition(_)));
        }
        assert!(driver.start_resource_monitoring().await.is_err());
        assert!(driver
            .start_alarm_dispatch(serde_json::Value::Null)
            .await
            .is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(DriverState::TopologySet.to_string(), "topology_set");
        assert_eq!(
            serde_json::to_string(&DriverState::Active).unwrap(),
            "\"active\""
        );
    }
}
