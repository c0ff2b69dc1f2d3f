//! In-process simulated platform network.
//!
//! Used by tests and by the host when the endpoint scheme is `mock://`.
//! Attribute histories, ports and alarms live in memory; tests inject
//! samples and alarms directly and can make the network unreachable or slow.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use platnet_events::{
    AlarmInstance, AlarmSeverity, AlarmType, AttributeSample, AttributeValue, NtpTimestamp,
};
use platnet_id::{AttributeId, PlatformId, PortId};
use serde_json::json;
use tracing::{debug, info};

use crate::backend::{
    AlarmDispatchParams, AlarmRecord, AlarmSubscription, AttributeDefinition, AttributeReadings,
    AttributeWrites, PlatformBackend, PlatformMetadata, PortConfig, PortInfo, PortState, Pong,
};
use crate::error::{AttributeError, DriverError, Result};
use crate::topology::Topology;

#[derive(Debug)]
struct SimAttribute {
    definition: AttributeDefinition,
    range: Option<RangeInclusive<f64>>,
    history: Vec<AttributeSample>,
}

#[derive(Debug, Default)]
struct SimPlatform {
    platform_type: Option<String>,
    children: Vec<PlatformId>,
    attributes: BTreeMap<AttributeId, SimAttribute>,
    ports: BTreeMap<PortId, PortInfo>,
    alarms: Vec<AlarmRecord>,
}

/// Alarm types a subscription accepts; `None` accepts all.
type AlarmFilter = Option<HashSet<AlarmType>>;

/// Simulated platform network backend.
pub struct SimulatorBackend {
    network: Mutex<BTreeMap<PlatformId, SimPlatform>>,
    subscriptions: Mutex<HashMap<String, AlarmFilter>>,
    subscription_counter: AtomicU64,
    alarm_counter: AtomicU64,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    auto_sample: AtomicBool,
}

impl SimulatorBackend {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self {
            network: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            subscription_counter: AtomicU64::new(0),
            alarm_counter: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            auto_sample: AtomicBool::new(false),
        }
    }

    /// Creates the reference cabled-observatory network:
    ///
    /// ```text
    /// Node1A -> MJ01A, Node1B
    /// Node1B -> Node1C
    /// Node1C -> Node1D, MJ01B
    /// Node1D -> MJ01C
    /// MJ01C  -> LJ01D
    /// ```
    ///
    /// Every platform reports a read-only `input_voltage`, a writable
    /// `input_bus_current` and one port named `<platform>_port_1`.
    pub fn default_network() -> Self {
        let sim = Self::new();
        let links: [(&str, &[&str]); 8] = [
            ("Node1A", &["MJ01A", "Node1B"]),
            ("Node1B", &["Node1C"]),
            ("Node1C", &["Node1D", "MJ01B"]),
            ("Node1D", &["MJ01C"]),
            ("MJ01C", &["LJ01D"]),
            ("MJ01A", &[]),
            ("MJ01B", &[]),
            ("LJ01D", &[]),
        ];

        for (platform, children) in links {
            let platform_id: PlatformId = sim_id(platform);
            sim.add_platform(platform_id.clone(), children.iter().map(|c| sim_id(c)));
            sim.set_platform_type(&platform_id, platform_type_of(platform));
            sim.add_attribute(
                &platform_id,
                AttributeDefinition {
                    attr_id: sim_id("input_voltage"),
                    units: Some("V".to_string()),
                    writable: false,
                    monitor_rate_ms: Some(5_000),
                },
                Some(0.0..=400.0),
            );
            sim.add_attribute(
                &platform_id,
                AttributeDefinition {
                    attr_id: sim_id("input_bus_current"),
                    units: Some("A".to_string()),
                    writable: true,
                    monitor_rate_ms: Some(5_000),
                },
                Some(0.0..=10.0),
            );
            sim.add_port(&platform_id, sim_id(&format!("{platform}_port_1")));
        }

        sim
    }

    fn network(&self) -> MutexGuard<'_, BTreeMap<PlatformId, SimPlatform>> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, AlarmFilter>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a platform and its children. Missing children are created empty.
    pub fn add_platform(&self, platform_id: PlatformId, children: impl IntoIterator<Item = PlatformId>) {
        let children: Vec<PlatformId> = children.into_iter().collect();
        let mut network = self.network();
        for child in &children {
            network.entry(child.clone()).or_default();
        }
        network.entry(platform_id).or_default().children = children;
    }

    pub fn set_platform_type(&self, platform_id: &PlatformId, platform_type: impl Into<String>) {
        self.network()
            .entry(platform_id.clone())
            .or_default()
            .platform_type = Some(platform_type.into());
    }

    /// Declares an attribute. Numeric writes are clamped to `range`.
    pub fn add_attribute(
        &self,
        platform_id: &PlatformId,
        definition: AttributeDefinition,
        range: Option<RangeInclusive<f64>>,
    ) {
        self.network()
            .entry(platform_id.clone())
            .or_default()
            .attributes
            .insert(
                definition.attr_id.clone(),
                SimAttribute {
                    definition,
                    range,
                    history: Vec::new(),
                },
            );
    }

    pub fn add_port(&self, platform_id: &PlatformId, port_id: PortId) {
        self.network()
            .entry(platform_id.clone())
            .or_default()
            .ports
            .insert(
                port_id.clone(),
                PortInfo {
                    port_id,
                    state: PortState::Off,
                    config: PortConfig::new(),
                },
            );
    }

    /// Records a sample stamped with the current time and returns the stamp.
    ///
    /// Undeclared attributes are created read-only.
    pub fn push_sample(
        &self,
        platform_id: &PlatformId,
        attr_id: &AttributeId,
        value: impl Into<AttributeValue>,
    ) -> NtpTimestamp {
        let mut network = self.network();
        let attribute = attribute_entry(&mut network, platform_id, attr_id);
        let timestamp = next_timestamp(attribute.history.last().map(|s| s.timestamp));
        attribute.history.push(AttributeSample::new(value, timestamp));
        timestamp
    }

    /// Records a sample with an explicit timestamp, keeping history sorted.
    pub fn push_sample_at(
        &self,
        platform_id: &PlatformId,
        attr_id: &AttributeId,
        value: impl Into<AttributeValue>,
        timestamp: NtpTimestamp,
    ) {
        let mut network = self.network();
        let history = &mut attribute_entry(&mut network, platform_id, attr_id).history;
        let at = history.partition_point(|s| s.timestamp <= timestamp);
        history.insert(at, AttributeSample::new(value, timestamp));
    }

    /// Raises an alarm on `platform_id` and returns the recorded alarm.
    pub fn raise_alarm(
        &self,
        platform_id: &PlatformId,
        alarm_type: AlarmType,
        severity: AlarmSeverity,
        description: impl Into<String>,
    ) -> AlarmRecord {
        let mut network = self.network();
        let platform = network.entry(platform_id.clone()).or_default();
        let sequence = self.alarm_counter.fetch_add(1, Ordering::SeqCst);
        let record = AlarmRecord {
            timestamp: next_timestamp(platform.alarms.last().map(|a| a.timestamp)),
            alarm_type,
            instance: AlarmInstance {
                instance_id: format!("sim-alarm-{sequence:08x}"),
                platform_id: platform_id.clone(),
                severity,
                description: description.into(),
                details: json!({ "source": "simulator" }),
            },
        };
        platform.alarms.push(record.clone());
        record
    }

    /// Makes every subsequent call fail with a connection error, or not.
    pub fn set_reachable(&self, reachable: bool) {
        info!(reachable, "[SIM] Platform network reachability changed");
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// When enabled, every read takes a fresh reading of each requested
    /// ranged attribute before answering.
    pub fn set_auto_sampling(&self, enabled: bool) {
        self.auto_sample.store(enabled, Ordering::SeqCst);
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions().len()
    }

    /// Full recorded history of an attribute.
    pub fn samples(&self, platform_id: &PlatformId, attr_id: &AttributeId) -> Vec<AttributeSample> {
        self.network()
            .get(platform_id)
            .and_then(|p| p.attributes.get(attr_id))
            .map(|a| a.history.clone())
            .unwrap_or_default()
    }

    async fn simulate_io(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(DriverError::Connection(
                "simulated platform network is unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn with_platform<T>(
        &self,
        platform_id: &PlatformId,
        f: impl FnOnce(&mut SimPlatform) -> Result<T>,
    ) -> Result<T> {
        let mut network = self.network();
        let platform = network.get_mut(platform_id).ok_or_else(|| {
            DriverError::InvalidTopology(format!(
                "platform {platform_id} is not part of the simulated network"
            ))
        })?;
        f(platform)
    }
}

impl Default for SimulatorBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformBackend for SimulatorBackend {
    fn name(&self) -> &str {
        "simulator"
    }

    async fn ping(&self) -> Result<Pong> {
        self.simulate_io().await?;
        Ok(Pong)
    }

    async fn activate(&self, platform_id: &PlatformId) -> Result<()> {
        self.simulate_io().await?;
        self.with_platform(platform_id, |_| Ok(()))?;
        debug!(platform_id = %platform_id, "[SIM] Platform activated");
        Ok(())
    }

    async fn discover_topology(&self, root: &PlatformId) -> Result<Topology> {
        self.simulate_io().await?;
        self.with_platform(root, |_| Ok(()))?;

        let network = Topology::from_children(
            self.network()
                .iter()
                .map(|(id, platform)| (id.clone(), platform.children.clone())),
        );
        network.subtree(root)
    }

    async fn get_metadata(&self, platform_id: &PlatformId) -> Result<PlatformMetadata> {
        self.simulate_io().await?;
        self.with_platform(platform_id, |platform| {
            let mut extra = serde_json::Map::new();
            extra.insert("ports".to_string(), json!(platform.ports.len()));
            Ok(PlatformMetadata {
                platform_id: platform_id.clone(),
                platform_type: platform.platform_type.clone(),
                attributes: platform
                    .attributes
                    .values()
                    .map(|a| a.definition.clone())
                    .collect(),
                extra,
            })
        })
    }

    async fn get_attribute_values(
        &self,
        platform_id: &PlatformId,
        attr_ids: &[AttributeId],
        since: NtpTimestamp,
    ) -> Result<AttributeReadings> {
        self.simulate_io().await?;
        let auto_sample = self.auto_sample.load(Ordering::SeqCst);

        self.with_platform(platform_id, |platform| {
            let mut readings = AttributeReadings::new();
            for attr_id in attr_ids {
                let Some(attribute) = platform.attributes.get_mut(attr_id) else {
                    readings.insert(attr_id.clone(), Err(AttributeError::Unknown));
                    continue;
                };

                if auto_sample {
                    take_reading(attribute);
                }

                let samples = attribute
                    .history
                    .iter()
                    .filter(|s| s.timestamp >= since)
                    .cloned()
                    .collect();
                readings.insert(attr_id.clone(), Ok(samples));
            }
            Ok(readings)
        })
    }

    async fn set_attribute_values(
        &self,
        platform_id: &PlatformId,
        assignments: &[(AttributeId, AttributeValue)],
    ) -> Result<AttributeWrites> {
        self.simulate_io().await?;
        self.with_platform(platform_id, |platform| {
            let mut writes = AttributeWrites::new();
            for (attr_id, value) in assignments {
                let result = match platform.attributes.get_mut(attr_id) {
                    None => Err(AttributeError::Unknown),
                    Some(attribute) if !attribute.definition.writable => {
                        Err(AttributeError::NotWritable)
                    }
                    Some(attribute) => coerce(value, attribute.range.as_ref()).map(|value| {
                        let timestamp =
                            next_timestamp(attribute.history.last().map(|s| s.timestamp));
                        let sample = AttributeSample::new(value, timestamp);
                        attribute.history.push(sample.clone());
                        sample
                    }),
                };
                writes.insert(attr_id.clone(), result);
            }
            Ok(writes)
        })
    }

    async fn get_ports(&self, platform_id: &PlatformId) -> Result<Vec<PortInfo>> {
        self.simulate_io().await?;
        self.with_platform(platform_id, |platform| {
            Ok(platform.ports.values().cloned().collect())
        })
    }

    async fn set_up_port(
        &self,
        platform_id: &PlatformId,
        port_id: &PortId,
        attributes: &PortConfig,
    ) -> Result<PortConfig> {
        self.simulate_io().await?;
        self.with_platform(platform_id, |platform| {
            let port = platform
                .ports
                .get_mut(port_id)
                .ok_or_else(|| DriverError::UnknownPort(port_id.clone()))?;
            port.config
                .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
            debug!(platform_id = %platform_id, port_id = %port_id, "[SIM] Port set up");
            Ok(port.config.clone())
        })
    }

    async fn subscribe_alarms(
        &self,
        platform_id: &PlatformId,
        params: &AlarmDispatchParams,
    ) -> Result<AlarmSubscription> {
        self.simulate_io().await?;
        self.with_platform(platform_id, |_| Ok(()))?;

        let filter: AlarmFilter = match params.get("alarm_types") {
            Some(types) => Some(
                serde_json::from_value::<HashSet<AlarmType>>(types.clone()).map_err(|e| {
                    DriverError::Config(format!("invalid alarm dispatch params: {e}"))
                })?,
            ),
            None => None,
        };

        let sequence = self.subscription_counter.fetch_add(1, Ordering::SeqCst);
        let subscription_id = format!("sim-sub-{sequence:08x}");
        self.subscriptions().insert(subscription_id.clone(), filter);

        debug!(platform_id = %platform_id, subscription_id = %subscription_id, "[SIM] Alarm subscription created");
        Ok(AlarmSubscription {
            subscription_id,
            platform_id: platform_id.clone(),
            params: params.clone(),
        })
    }

    async fn fetch_alarms(
        &self,
        subscription: &AlarmSubscription,
        since: NtpTimestamp,
    ) -> Result<Vec<AlarmRecord>> {
        self.simulate_io().await?;
        let filter = self
            .subscriptions()
            .get(&subscription.subscription_id)
            .cloned()
            .ok_or_else(|| {
                DriverError::InvalidState(format!(
                    "unknown alarm subscription {}",
                    subscription.subscription_id
                ))
            })?;

        self.with_platform(&subscription.platform_id, |platform| {
            Ok(platform
                .alarms
                .iter()
                .filter(|a| a.timestamp >= since)
                .filter(|a| filter.as_ref().map_or(true, |f| f.contains(&a.alarm_type)))
                .cloned()
                .collect())
        })
    }

    async fn unsubscribe_alarms(&self, subscription: &AlarmSubscription) -> Result<()> {
        self.simulate_io().await?;
        match self.subscriptions().remove(&subscription.subscription_id) {
            Some(_) => Ok(()),
            None => Err(DriverError::InvalidState(format!(
                "unknown alarm subscription {}",
                subscription.subscription_id
            ))),
        }
    }
}

fn sim_id<T: std::str::FromStr>(s: &str) -> T
where
    T::Err: std::fmt::Debug,
{
    match s.parse() {
        Ok(id) => id,
        Err(e) => unreachable!("built-in simulator id {s:?} is invalid: {e:?}"),
    }
}

fn platform_type_of(platform: &str) -> &'static str {
    if platform.starts_with("Node") {
        "node"
    } else if platform.starts_with("MJ") {
        "medium_power_junction_box"
    } else {
        "low_power_junction_box"
    }
}

fn attribute_entry<'a>(
    network: &'a mut BTreeMap<PlatformId, SimPlatform>,
    platform_id: &PlatformId,
    attr_id: &AttributeId,
) -> &'a mut SimAttribute {
    network
        .entry(platform_id.clone())
        .or_default()
        .attributes
        .entry(attr_id.clone())
        .or_insert_with(|| SimAttribute {
            definition: AttributeDefinition {
                attr_id: attr_id.clone(),
                units: None,
                writable: false,
                monitor_rate_ms: None,
            },
            range: None,
            history: Vec::new(),
        })
}

/// The current time, or just after `last` if the clock has not moved past it.
fn next_timestamp(last: Option<NtpTimestamp>) -> NtpTimestamp {
    let now = NtpTimestamp::now();
    match last {
        Some(last) if last >= now => last.successor().unwrap_or(last),
        _ => now,
    }
}

/// Validates a write and clamps numeric values into `range`.
fn coerce(
    value: &AttributeValue,
    range: Option<&RangeInclusive<f64>>,
) -> std::result::Result<AttributeValue, AttributeError> {
    let Some(range) = range else {
        return Ok(value.clone());
    };

    let number = value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        .filter(|n| n.is_finite())
        .ok_or_else(|| AttributeError::InvalidValue {
            reason: format!("expected a number, got {value}"),
        })?;

    Ok(json!(number.clamp(*range.start(), *range.end())))
}

/// Appends a synthetic reading to a ranged attribute.
fn take_reading(attribute: &mut SimAttribute) {
    let Some(range) = &attribute.range else {
        return;
    };
    let timestamp = next_timestamp(attribute.history.last().map(|s| s.timestamp));
    let span = range.end() - range.start();
    let phase = f64::from(timestamp.seconds() % 60) / 60.0 * std::f64::consts::TAU;
    let value = range.start() + span * (0.5 + 0.1 * phase.sin());
    let value = (value * 1000.0).round() / 1000.0;
    attribute.history.push(AttributeSample::new(value, timestamp));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pid(s: &str) -> PlatformId {
        s.parse().unwrap()
    }

    fn aid(s: &str) -> AttributeId {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_network_topology() {
        let sim = SimulatorBackend::default_network();
        let network = sim.network();
        assert_eq!(network[&pid("Node1D")].children, vec![pid("MJ01C")]);
        assert_eq!(network[&pid("MJ01C")].children, vec![pid("LJ01D")]);
        assert!(network[&pid("LJ01D")].children.is_empty());
        assert_eq!(
            network[&pid("Node1D")].platform_type.as_deref(),
            Some("node")
        );
    }

    #[tokio::test]
    async fn test_discover_topology_resolves_subtree() {
        let sim = SimulatorBackend::default_network();
        let topology = sim.discover_topology(&pid("Node1D")).await.unwrap();
        let node = topology.resolve(&pid("Node1D"), None, None).unwrap();

        assert_eq!(node.subplatform_ids().into_iter().collect::<Vec<_>>(), vec![pid("MJ01C")]);
        assert_eq!(node.len(), 3);
    }

    #[test]
    fn test_next_timestamp_crosses_era_rollover() {
        let end_of_era0 = NtpTimestamp::from_ntp64(0, u64::MAX);
        let next = next_timestamp(Some(end_of_era0));
        assert_eq!(next, NtpTimestamp::from_ntp64(1, 0));

        let after = next_timestamp(Some(next));
        assert!(after > next);
        assert_eq!(after.era(), 1);
    }

    #[rstest]
    #[case(json!(7), json!(7.0))]
    #[case(json!("7"), json!(7.0))]
    #[case(json!("9876"), json!(10.0))]
    #[case(json!(-3.5), json!(0.0))]
    fn test_coerce_clamps(#[case] input: AttributeValue, #[case] expected: AttributeValue) {
        assert_eq!(coerce(&input, Some(&(0.0..=10.0))).unwrap(), expected);
    }

    #[test]
    fn test_coerce_rejects_non_numeric() {
        let err = coerce(&json!("high"), Some(&(0.0..=10.0))).unwrap_err();
        assert!(matches!(err, AttributeError::InvalidValue { .. }));
        assert_eq!(coerce(&json!("high"), None).unwrap(), json!("high"));
    }

    #[tokio::test]
    async fn test_write_rules() {
        let sim = SimulatorBackend::default_network();
        let writes = sim
            .set_attribute_values(
                &pid("Node1D"),
                &[
                    (aid("input_bus_current"), json!("7")),
                    (aid("input_voltage"), json!(120)),
                    (aid("bogus"), json!(1)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(writes[&aid("input_bus_current")].as_ref().unwrap().value, json!(7.0));
        assert_eq!(writes[&aid("input_voltage")], Err(AttributeError::NotWritable));
        assert_eq!(writes[&aid("bogus")], Err(AttributeError::Unknown));
        assert_eq!(sim.samples(&pid("Node1D"), &aid("input_bus_current")).len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_network() {
        let sim = SimulatorBackend::default_network();
        sim.set_reachable(false);
        assert!(sim.ping().await.unwrap_err().is_connection_error());

        sim.set_reachable(true);
        assert_eq!(sim.ping().await.unwrap(), Pong);
    }

    #[tokio::test]
    async fn test_unknown_platform() {
        let sim = SimulatorBackend::default_network();
        let err = sim.activate(&pid("Node9Z")).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidTopology(_)));
    }

    #[test]
    fn test_push_sample_is_monotonic() {
        let sim = SimulatorBackend::new();
        let (p, a) = (pid("P1"), aid("temp"));
        let first = sim.push_sample(&p, &a, 1);
        let second = sim.push_sample(&p, &a, 2);
        assert!(second > first);

        sim.push_sample_at(&p, &a, 0, NtpTimestamp::from_parts(1, 0));
        let history = sim.samples(&p, &a);
        assert_eq!(history[0].value, json!(0));
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn test_alarm_subscription_filter() {
        let sim = SimulatorBackend::default_network();
        let platform = pid("Node1D");
        let sub = sim
            .subscribe_alarms(&platform, &json!({ "alarm_types": ["over_temperature"] }))
            .await
            .unwrap();

        sim.raise_alarm(&platform, AlarmType::PowerFault, AlarmSeverity::Critical, "trip");
        sim.raise_alarm(&platform, AlarmType::OverTemperature, AlarmSeverity::Warning, "hot");

        let alarms = sim.fetch_alarms(&sub, NtpTimestamp::ZERO).await.unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].alarm_type, AlarmType::OverTemperature);

        sim.unsubscribe_alarms(&sub).await.unwrap();
        assert_eq!(sim.active_subscriptions(), 0);
        assert!(sim.fetch_alarms(&sub, NtpTimestamp::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_sampling_stays_in_range() {
        let sim = SimulatorBackend::default_network();
        sim.set_auto_sampling(true);
        let readings = sim
            .get_attribute_values(&pid("Node1D"), &[aid("input_bus_current")], NtpTimestamp::ZERO)
            .await
            .unwrap();

        let samples = readings[&aid("input_bus_current")].as_ref().unwrap();
        assert_eq!(samples.len(), 1);
        let value = samples[0].value.as_f64().unwrap();
        assert!((0.0..=10.0).contains(&value));
    }
}
