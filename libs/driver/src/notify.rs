//! Event delivery to the supervising agent.
//!
//! Each driver owns one [`EventNotifier`] holding a single listener slot.
//! Delivery is synchronous and serialized: a delivery lock is held for the
//! duration of the listener call, so two background tasks never run the
//! listener concurrently. The slot has its own lock, held only to read or
//! replace the listener, so a listener may swap itself out or query the
//! driver while it runs.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use platnet_events::DriverEvent;
use platnet_id::PlatformId;
use serde::Serialize;
use tracing::{debug, error, warn};

/// Receiver of driver events.
///
/// Called on a runtime worker thread while the driver's delivery lock is
/// held. Implementations must return promptly; hand work off to a channel
/// rather than blocking. Synchronous driver calls such as
/// `set_event_listener` are fine from inside `on_event`.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &DriverEvent);
}

impl<F> EventListener for F
where
    F: Fn(&DriverEvent) + Send + Sync,
{
    fn on_event(&self, event: &DriverEvent) {
        self(event)
    }
}

/// Counters describing event delivery and background polling.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    listener_failures: AtomicU64,
    monitor_poll_failures: AtomicU64,
    alarm_poll_failures: AtomicU64,
}

impl Diagnostics {
    pub(crate) fn record_monitor_poll_failure(&self) {
        self.monitor_poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_alarm_poll_failure(&self) {
        self.alarm_poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            monitor_poll_failures: self.monitor_poll_failures.load(Ordering::Relaxed),
            alarm_poll_failures: self.alarm_poll_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a driver's diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Events handed to the listener.
    pub events_delivered: u64,

    /// Events discarded because no listener was registered.
    pub events_dropped: u64,

    /// Listener calls that panicked.
    pub listener_failures: u64,

    pub monitor_poll_failures: u64,

    pub alarm_poll_failures: u64,
}

/// Single-slot, serialized event delivery.
pub(crate) struct EventNotifier {
    platform_id: PlatformId,
    listener: Mutex<Option<Arc<dyn EventListener>>>,
    delivery: Mutex<()>,
    diagnostics: Diagnostics,
}

impl EventNotifier {
    pub(crate) fn new(platform_id: PlatformId) -> Self {
        Self {
            platform_id,
            listener: Mutex::new(None),
            delivery: Mutex::new(()),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Registers the listener, replacing any previous one.
    pub(crate) fn set_listener(&self, listener: Arc<dyn EventListener>) {
        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.replace(listener).is_some() {
            debug!(platform_id = %self.platform_id, "Replaced event listener");
        }
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub(crate) fn snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Delivers `event` to the listener, or drops it if none is registered.
    ///
    /// Never fails: a panicking listener is caught, logged and counted.
    pub(crate) fn notify(&self, event: DriverEvent) {
        debug!(platform_id = %self.platform_id, event = %event, "Notifying driver event");

        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(listener) = listener else {
            self.diagnostics.events_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                platform_id = %self.platform_id,
                event = %event,
                "No event listener set, dropping driver event"
            );
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
            Ok(()) => {
                self.diagnostics.events_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                self.diagnostics.listener_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    platform_id = %self.platform_id,
                    event_id = %event.event_id(),
                    panic = %panic_message(panic.as_ref()),
                    "Event listener panicked"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
