//! platnet Platform Agent Library
//!
//! The platform agent supervises the drivers of one platform network. It
//! resolves the network topology, runs a driver per platform and publishes
//! every attribute sample and alarm the drivers report.
//!
//! ## Modules
//!
//! - `config`: environment-driven configuration
//! - `agent`: driver construction, event forwarding and shutdown

pub mod agent;
pub mod config;

pub use agent::{backend_for, load_topology, PlatformAgent};
pub use config::Config;
