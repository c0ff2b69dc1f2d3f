//! # platnet-id
//!
//! Typed identifiers for the platnet platform network.
//!
//! ## Design Principles
//!
//! - Platform, attribute and port IDs are assigned by the platform network;
//!   we validate them but never invent them
//! - Event IDs are system-generated and time-ordered
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent mixing different resource kinds
//!
//! ## ID Formats
//!
//! Externally-assigned names are kept verbatim:
//! - `Node1D`, `MJ01C` (platforms)
//! - `input_voltage` (attributes)
//! - `Node1D_port_1` (ports)
//!
//! Event IDs use a prefixed ULID: `evt_01HV4Z2WQXKJNM8GPQY6VBKC3D`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
