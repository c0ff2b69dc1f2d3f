//! Driver supervision.
//!
//! The agent builds one driver per platform in the resolved network, starts
//! monitoring and alarm dispatch on each, and forwards every event through a
//! bounded channel to a publishing task.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use platnet_driver::{PlatformBackend, PlatformDriver, SimulatorBackend, Topology};
use platnet_events::DriverEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Creates the backend named by the endpoint scheme.
pub fn backend_for(config: &Config) -> Result<Arc<dyn PlatformBackend>> {
    let driver_config = config.driver_config()?;
    match driver_config.scheme() {
        Some("mock") => {
            let sim = SimulatorBackend::default_network();
            sim.set_auto_sampling(true);
            Ok(Arc::new(sim))
        }
        Some(scheme) => bail!("unsupported endpoint scheme {scheme:?}"),
        None => bail!("endpoint {:?} has no scheme", config.endpoint),
    }
}

/// Reads a TOML topology file.
pub fn load_topology(path: &Path) -> Result<Topology> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read topology file {}", path.display()))?;
    Topology::from_toml_str(&contents)
        .with_context(|| format!("invalid topology file {}", path.display()))
}

/// Running set of drivers for one platform network.
pub struct PlatformAgent {
    /// Root first, then descendants in pre-order.
    drivers: Vec<Arc<PlatformDriver>>,
    publisher: JoinHandle<u64>,
    publisher_shutdown: watch::Sender<bool>,
}

impl PlatformAgent {
    /// Builds, activates and starts a driver for every platform under
    /// `config.platform_id`.
    pub async fn start(config: &Config, backend: Arc<dyn PlatformBackend>) -> Result<Self> {
        let driver_config = config.driver_config()?;
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (publisher_shutdown, shutdown_rx) = watch::channel(false);
        let publisher = tokio::spawn(run_publisher(events_rx, shutdown_rx));

        let root = Arc::new(PlatformDriver::new(
            config.platform_id.clone(),
            driver_config.clone(),
            None,
            Arc::clone(&backend),
        )?);
        if let Some(path) = &config.topology_file {
            root.set_topology(load_topology(path)?, None, None)?;
        }
        root.go_active()
            .await
            .with_context(|| format!("failed to activate {}", config.platform_id))?;

        let mut agent = Self {
            drivers: vec![Arc::clone(&root)],
            publisher,
            publisher_shutdown,
        };

        let node = root.node()?;
        for child in node.iter().skip(1) {
            let driver = Arc::new(PlatformDriver::new(
                child.platform_id().clone(),
                driver_config.clone(),
                child.parent_id().cloned(),
                Arc::clone(&backend),
            )?);
            driver.set_topology(child.to_topology(), None, None)?;
            if let Err(e) = driver.go_active().await {
                agent.shutdown().await;
                return Err(e).with_context(|| format!("failed to activate {}", child.platform_id()));
            }
            agent.drivers.push(driver);
        }

        for driver in agent.drivers.clone() {
            attach_forwarder(&driver, events_tx.clone());
            let started = async {
                driver.start_resource_monitoring().await?;
                driver.start_alarm_dispatch(serde_json::json!({})).await
            };
            if let Err(e) = started.await {
                let platform_id = driver.platform_id().clone();
                agent.shutdown().await;
                return Err(e).with_context(|| format!("failed to start {platform_id}"));
            }
        }

        info!(
            platform_id = %config.platform_id,
            drivers = agent.drivers.len(),
            "Platform agent started"
        );
        Ok(agent)
    }

    pub fn drivers(&self) -> &[Arc<PlatformDriver>] {
        &self.drivers
    }

    /// Destroys every driver, children first, and waits for the publisher
    /// to drain. Returns the number of events published.
    pub async fn shutdown(self) -> u64 {
        for driver in self.drivers.iter().rev() {
            driver.destroy().await;
        }
        self.publisher_shutdown.send_replace(true);

        match self.publisher.await {
            Ok(published) => {
                info!(published, "Platform agent stopped");
                published
            }
            Err(e) => {
                error!(error = %e, "Event publisher task failed");
                0
            }
        }
    }
}

fn attach_forwarder(driver: &PlatformDriver, events_tx: mpsc::Sender<DriverEvent>) {
    let platform_id = driver.platform_id().clone();
    driver.set_event_listener(move |event: &DriverEvent| {
        if let Err(e) = events_tx.try_send(event.clone()) {
            warn!(platform_id = %platform_id, error = %e, "Event channel rejected driver event");
        }
    });
}

/// Logs each event as JSON until shutdown, then drains what is queued.
async fn run_publisher(
    mut events_rx: mpsc::Receiver<DriverEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut published = 0u64;
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => published += publish(&event),
                None => break,
            },
            _ = shutdown.changed() => {
                while let Ok(event) = events_rx.try_recv() {
                    published += publish(&event);
                }
                break;
            }
        }
    }
    debug!(published, "Event publisher finished");
    published
}

fn publish(event: &DriverEvent) -> u64 {
    match event.to_json() {
        Ok(json) => {
            info!(
                platform_id = %event.platform_id(),
                event_type = event.event_type(),
                event = %json,
                "Driver event"
            );
            1
        }
        Err(e) => {
            error!(event_id = %event.event_id(), error = %e, "Failed to serialize driver event");
            0
        }
    }
}
