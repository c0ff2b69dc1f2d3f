//! # platnet-events
//!
//! Driver event definitions and the canonical timestamp for the platnet
//! platform network.
//!
//! ## Design Principles
//!
//! - Events are immutable records produced by a platform driver
//! - Every event belongs to exactly one variant of [`DriverEvent`]
//! - Every event carries a fresh [`platnet_id::EventId`] and an
//!   [`NtpTimestamp`]
//! - All timestamps use one representation so ordering comparisons and
//!   persistence round-trip exactly
//!
//! ## Event Types
//!
//! - Attribute values (`attribute_value`): a sampled platform attribute
//! - Alarms (`alarm`): an abnormal condition raised by a platform

mod error;
mod timestamp;
mod types;

pub use error::EventError;
pub use timestamp::*;
pub use types::*;
