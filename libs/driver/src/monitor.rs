//! Resource monitoring loop.
//!
//! Monitored attributes are grouped by polling period and each group gets
//! its own task. Every tick the task asks the backend for samples newer than
//! what it has already delivered and turns each new sample into an
//! attribute value event.
//!
//! Delivery per attribute is strictly increasing in timestamp. The
//! high-water marks outlive a monitoring session, so restarting monitoring
//! never replays samples that were already delivered.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use platnet_events::{AlarmInstance, AlarmSeverity, AlarmType, DriverEvent, NtpTimestamp};
use platnet_id::{AttributeId, PlatformId};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backend::{bounded, AttributeReadings, PlatformBackend, PlatformMetadata};
use crate::config::{DriverConfig, MonitoredAttribute};
use crate::error::DriverError;
use crate::notify::EventNotifier;
use crate::tasks::{shutdown_requested, TaskGroup};

/// Last delivered timestamp per attribute.
pub(crate) type HighWaterMarks = Arc<Mutex<HashMap<AttributeId, NtpTimestamp>>>;

/// Groups attributes by effective polling period.
///
/// An attribute listed more than once is polled at its first listed rate.
pub(crate) fn rate_groups(
    config: &DriverConfig,
    attributes: &[MonitoredAttribute],
) -> BTreeMap<Duration, Vec<AttributeId>> {
    let mut seen = HashSet::new();
    let mut groups: BTreeMap<Duration, Vec<AttributeId>> = BTreeMap::new();

    for attribute in attributes {
        if !seen.insert(&attribute.attr_id) {
            continue;
        }
        groups
            .entry(config.monitor_rate(attribute))
            .or_default()
            .push(attribute.attr_id.clone());
    }

    groups
}

/// Attributes to monitor when the configuration names none: everything the
/// platform reports, at the platform's suggested rates.
pub(crate) fn attributes_from_metadata(metadata: &PlatformMetadata) -> Vec<MonitoredAttribute> {
    metadata
        .attributes
        .iter()
        .map(|def| MonitoredAttribute {
            attr_id: def.attr_id.clone(),
            monitor_rate_ms: def.monitor_rate_ms.filter(|ms| *ms > 0),
        })
        .collect()
}

/// State shared by the tasks of one monitoring session.
pub(crate) struct ResourceMonitor {
    platform_id: PlatformId,
    backend: Arc<dyn PlatformBackend>,
    notifier: Arc<EventNotifier>,
    timeout: Duration,
    connection_lost_threshold: u32,
    high_water: HighWaterMarks,
    started_at: NtpTimestamp,
    consecutive_failures: AtomicU32,
    /// Instance id of the communication-lost alarm currently raised.
    outage: Mutex<Option<String>>,
}

impl ResourceMonitor {
    pub(crate) fn new(
        platform_id: PlatformId,
        config: &DriverConfig,
        backend: Arc<dyn PlatformBackend>,
        notifier: Arc<EventNotifier>,
        high_water: HighWaterMarks,
    ) -> Self {
        Self {
            platform_id,
            backend,
            notifier,
            timeout: config.timeout(),
            connection_lost_threshold: config.connection_lost_threshold,
            high_water,
            started_at: NtpTimestamp::now(),
            consecutive_failures: AtomicU32::new(0),
            outage: Mutex::new(None),
        }
    }

    /// Spawns one polling task per rate group.
    pub(crate) fn spawn(self, groups: BTreeMap<Duration, Vec<AttributeId>>) -> TaskGroup {
        let monitor = Arc::new(self);
        let mut tasks = TaskGroup::new("resource_monitor");

        for (rate, attrs) in groups {
            let shutdown = tasks.shutdown_signal();
            tasks.spawn(Arc::clone(&monitor).run(rate, attrs, shutdown));
        }

        tasks
    }

    async fn run(self: Arc<Self>, rate: Duration, attrs: Vec<AttributeId>, mut shutdown: watch::Receiver<bool>) {
        info!(
            platform_id = %self.platform_id,
            rate_ms = rate.as_millis() as u64,
            attributes = attrs.len(),
            "Starting resource monitor"
        );

        let mut ticker = tokio::time::interval(rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reported = HashSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            let since = self.since(&attrs);
            let poll = bounded(
                "get_attribute_values",
                self.timeout,
                self.backend.get_attribute_values(&self.platform_id, &attrs, since),
            );

            let result = tokio::select! {
                result = poll => result,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            match result {
                Ok(readings) => {
                    self.poll_succeeded(&shutdown);
                    self.deliver(readings, &attrs, &shutdown, &mut reported);
                }
                Err(e) => self.poll_failed(&e, &shutdown),
            }
        }

        debug!(
            platform_id = %self.platform_id,
            rate_ms = rate.as_millis() as u64,
            "Resource monitor stopped"
        );
    }

    /// Lower bound for the next read of `attrs`.
    fn since(&self, attrs: &[AttributeId]) -> NtpTimestamp {
        let marks = self.high_water.lock().unwrap_or_else(PoisonError::into_inner);
        attrs
            .iter()
            .map(|attr_id| marks.get(attr_id).copied().unwrap_or(self.started_at))
            .min()
            .unwrap_or(self.started_at)
    }

    /// Records `timestamp` as delivered for `attr_id` if it is new.
    fn advance(&self, attr_id: &AttributeId, timestamp: NtpTimestamp) -> bool {
        let mut marks = self.high_water.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = match marks.get(attr_id) {
            Some(mark) => timestamp > *mark,
            None => timestamp >= self.started_at,
        };
        if fresh {
            marks.insert(attr_id.clone(), timestamp);
        }
        fresh
    }

    fn deliver(
        &self,
        readings: AttributeReadings,
        attrs: &[AttributeId],
        shutdown: &watch::Receiver<bool>,
        reported: &mut HashSet<AttributeId>,
    ) {
        for (attr_id, result) in readings {
            if !attrs.contains(&attr_id) {
                continue;
            }

            let mut samples = match result {
                Ok(samples) => {
                    reported.remove(&attr_id);
                    samples
                }
                Err(e) => {
                    if reported.insert(attr_id.clone()) {
                        warn!(
                            platform_id = %self.platform_id,
                            attr_id = %attr_id,
                            error = %e,
                            "Monitored attribute could not be read"
                        );
                    }
                    continue;
                }
            };

            samples.sort_by_key(|sample| sample.timestamp);
            for sample in samples {
                if *shutdown.borrow() {
                    return;
                }
                if !self.advance(&attr_id, sample.timestamp) {
                    continue;
                }
                self.notifier.notify(DriverEvent::attribute_value(
                    sample.timestamp,
                    self.platform_id.clone(),
                    attr_id.clone(),
                    sample.value,
                ));
            }
        }
    }

    fn poll_succeeded(&self, shutdown: &watch::Receiver<bool>) {
        let failures = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if failures > 0 {
            info!(
                platform_id = %self.platform_id,
                consecutive_failures = failures,
                "Resource monitor recovered"
            );
        }

        let outage = self.outage.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(instance_id) = outage {
            if *shutdown.borrow() {
                return;
            }
            self.notifier.notify(DriverEvent::alarm(
                NtpTimestamp::now(),
                AlarmType::CommunicationRestored,
                AlarmInstance {
                    instance_id,
                    platform_id: self.platform_id.clone(),
                    severity: AlarmSeverity::Info,
                    description: "platform network reachable again".to_string(),
                    details: serde_json::Value::Null,
                },
            ));
        }
    }

    fn poll_failed(&self, e: &DriverError, shutdown: &watch::Receiver<bool>) {
        self.notifier.diagnostics().record_monitor_poll_failure();
        let consecutive_failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        if consecutive_failures <= self.connection_lost_threshold {
            warn!(
                platform_id = %self.platform_id,
                error = %e,
                consecutive_failures,
                "Resource monitor poll failed"
            );
        } else {
            error!(
                platform_id = %self.platform_id,
                error = %e,
                consecutive_failures,
                "Resource monitor poll failed repeatedly"
            );
        }

        if consecutive_failures < self.connection_lost_threshold || !e.is_connection_error() {
            return;
        }

        let timestamp = NtpTimestamp::now();
        let instance_id = {
            let mut outage = self.outage.lock().unwrap_or_else(PoisonError::into_inner);
            if outage.is_some() {
                return;
            }
            let instance_id = format!("{}:communication:{}", self.platform_id, timestamp);
            *outage = Some(instance_id.clone());
            instance_id
        };

        if *shutdown.borrow() {
            return;
        }
        self.notifier.notify(DriverEvent::alarm(
            timestamp,
            AlarmType::CommunicationLost,
            AlarmInstance {
                instance_id,
                platform_id: self.platform_id.clone(),
                severity: AlarmSeverity::Critical,
                description: format!(
                    "platform network unreachable after {consecutive_failures} consecutive polls"
                ),
                details: json!({
                    "consecutive_failures": consecutive_failures,
                    "error": e.to_string(),
                }),
            },
        ));
    }
}
