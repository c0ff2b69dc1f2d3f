//! # platnet-driver
//!
//! Platform driver abstraction for the platnet platform network.
//!
//! A [`PlatformDriver`] stands for one platform (a node, junction box or
//! other device) in a tree-shaped network. It:
//!
//! - resolves its place in the network topology on activation
//! - answers attribute, port and metadata queries through a
//!   [`PlatformBackend`]
//! - polls monitored attributes in the background and pushes each new
//!   sample to its [`EventListener`] as a [`DriverEvent`]
//! - relays platform alarms while alarm dispatch is running
//!
//! [`SimulatorBackend`] is an in-memory network for tests and local runs.
//!
//! [`DriverEvent`]: platnet_events::DriverEvent

mod alarm;
mod backend;
mod config;
mod driver;
mod error;
mod monitor;
mod notify;
mod simulator;
mod tasks;
mod topology;

pub use backend::{
    AlarmDispatchParams, AlarmRecord, AlarmSubscription, AttributeDefinition, AttributeReadings,
    AttributeWrites, PlatformBackend, PlatformMetadata, PortConfig, PortInfo, PortState, Pong,
};
pub use config::{DriverConfig, MonitoredAttribute};
pub use driver::{DriverState, PlatformDriver};
pub use error::{AttributeError, DriverError, Result};
pub use notify::{DiagnosticsSnapshot, EventListener};
pub use simulator::SimulatorBackend;
pub use topology::{DeviceIdentity, DeviceMap, PlatformNode, StreamConfig, StreamConfigMap, Topology};
