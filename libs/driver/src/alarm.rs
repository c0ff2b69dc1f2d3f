//! Alarm dispatch.
//!
//! While dispatch is running the driver holds a backend alarm subscription
//! and polls it, forwarding each newly reported alarm as an alarm event.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use platnet_events::{DriverEvent, NtpTimestamp};
use platnet_id::PlatformId;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::{bounded, AlarmRecord, AlarmSubscription, PlatformBackend};
use crate::notify::EventNotifier;
use crate::tasks::{shutdown_requested, TaskGroup};

/// A running alarm dispatch session.
pub(crate) struct AlarmDispatch {
    pub(crate) subscription: AlarmSubscription,
    pub(crate) tasks: TaskGroup,
}

/// Polls one alarm subscription.
pub(crate) struct AlarmPoller {
    platform_id: PlatformId,
    backend: Arc<dyn PlatformBackend>,
    notifier: Arc<EventNotifier>,
    timeout: Duration,
    interval: Duration,
    subscription: AlarmSubscription,
    /// Timestamp of the newest alarm forwarded so far.
    cursor: NtpTimestamp,
    /// Instances already forwarded at `cursor`.
    seen_at_cursor: HashSet<String>,
}

impl AlarmPoller {
    pub(crate) fn new(
        platform_id: PlatformId,
        backend: Arc<dyn PlatformBackend>,
        notifier: Arc<EventNotifier>,
        timeout: Duration,
        interval: Duration,
        subscription: AlarmSubscription,
        since: NtpTimestamp,
    ) -> Self {
        Self {
            platform_id,
            backend,
            notifier,
            timeout,
            interval,
            subscription,
            cursor: since,
            seen_at_cursor: HashSet::new(),
        }
    }

    pub(crate) fn spawn(self) -> AlarmDispatch {
        let mut tasks = TaskGroup::new("alarm_dispatch");
        let subscription = self.subscription.clone();
        let shutdown = tasks.shutdown_signal();
        tasks.spawn(self.run(shutdown));
        AlarmDispatch { subscription, tasks }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            platform_id = %self.platform_id,
            subscription_id = %self.subscription.subscription_id,
            interval_ms = self.interval.as_millis() as u64,
            "Starting alarm dispatch"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            let fetch = bounded(
                "fetch_alarms",
                self.timeout,
                self.backend.fetch_alarms(&self.subscription, self.cursor),
            );

            let result = tokio::select! {
                result = fetch => result,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            match result {
                Ok(records) => {
                    consecutive_failures = 0;
                    self.forward(records, &shutdown);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.notifier.diagnostics().record_alarm_poll_failure();
                    warn!(
                        platform_id = %self.platform_id,
                        error = %e,
                        consecutive_failures,
                        "Alarm poll failed"
                    );
                }
            }
        }

        debug!(platform_id = %self.platform_id, "Alarm dispatch stopped");
    }

    fn forward(&mut self, mut records: Vec<AlarmRecord>, shutdown: &watch::Receiver<bool>) {
        records.sort_by_key(|record| record.timestamp);

        for record in records {
            if *shutdown.borrow() {
                return;
            }
            if !self.advance(&record) {
                continue;
            }
            debug!(
                platform_id = %self.platform_id,
                alarm_type = %record.alarm_type,
                instance_id = %record.instance.instance_id,
                "Dispatching alarm"
            );
            self.notifier.notify(DriverEvent::alarm(
                record.timestamp,
                record.alarm_type,
                record.instance,
            ));
        }
    }

    /// Moves the cursor past `record`, returning false if it was already
    /// forwarded or predates the session.
    fn advance(&mut self, record: &AlarmRecord) -> bool {
        if record.timestamp < self.cursor {
            return false;
        }
        if record.timestamp > self.cursor {
            self.cursor = record.timestamp;
            self.seen_at_cursor.clear();
        }
        self.seen_at_cursor.insert(record.instance.instance_id.clone())
    }
}
