//! Shared helpers for driver integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use platnet_driver::{
    AttributeDefinition, DriverConfig, MonitoredAttribute, PlatformDriver, SimulatorBackend,
};
use platnet_events::{AlarmEvent, AttributeValue, DriverEvent, NtpTimestamp};
use platnet_id::{AttributeId, PlatformId};

pub fn pid(s: &str) -> PlatformId {
    s.parse().unwrap()
}

pub fn aid(s: &str) -> AttributeId {
    s.parse().unwrap()
}

/// Config with short periods so background loops turn over quickly.
pub fn fast_config() -> DriverConfig {
    DriverConfig::new("mock://test")
        .with_timeout(Duration::from_millis(500))
        .with_polling_interval(Duration::from_millis(20))
        .with_alarm_poll_interval(Duration::from_millis(20))
}

/// A simulator with platform `P1` reporting `temp` and `pressure`.
pub fn single_platform() -> Arc<SimulatorBackend> {
    let sim = SimulatorBackend::new();
    sim.add_platform(pid("P1"), []);
    for attr in ["temp", "pressure"] {
        sim.add_attribute(
            &pid("P1"),
            AttributeDefinition {
                attr_id: aid(attr),
                units: None,
                writable: false,
                monitor_rate_ms: Some(20),
            },
            None,
        );
    }
    Arc::new(sim)
}

/// An active driver for `P1` monitoring the given attributes.
pub async fn active_driver(sim: &Arc<SimulatorBackend>, monitored: &[&str]) -> PlatformDriver {
    let config = monitored.iter().fold(fast_config(), |config, attr| {
        config.with_monitored_attribute(MonitoredAttribute::new(aid(attr)))
    });
    let driver = PlatformDriver::new(pid("P1"), config, None, sim.clone()).unwrap();
    driver.go_active().await.unwrap();
    driver
}

/// Records every event a driver delivers.
#[derive(Clone, Default)]
pub struct Collector {
    events: Arc<Mutex<Vec<DriverEvent>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, driver: &PlatformDriver) {
        let events = Arc::clone(&self.events);
        driver.set_event_listener(move |event: &DriverEvent| {
            events.lock().unwrap().push(event.clone());
        });
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Delivered `(timestamp, value)` pairs for one attribute.
    pub fn values_of(&self, attr: &str) -> Vec<(NtpTimestamp, AttributeValue)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DriverEvent::AttributeValue(e) if e.attr_id().as_str() == attr => {
                    Some((e.timestamp(), e.value().clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn alarms(&self) -> Vec<AlarmEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DriverEvent::Alarm(e) => Some(e),
                _ => None,
            })
            .collect()
    }
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Gives background loops several polling periods to act.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(120)).await;
}
