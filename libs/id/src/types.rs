//! Typed ID definitions for platform network resources.
//!
//! Platforms, attributes and ports are named by the platform network itself,
//! so their IDs are validated text. Driver events get system-generated,
//! ULID-based IDs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::{define_name_id, IdError};

/// Maximum length of an externally-assigned name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Validates an externally-assigned name.
///
/// Names must be non-empty, at most [`MAX_NAME_LEN`] bytes, and made of ASCII
/// alphanumerics plus `_`, `-`, `.` and `:`.
pub fn validate_name(name: &str) -> Result<(), IdError> {
    if name.is_empty() {
        return Err(IdError::Empty);
    }

    if name.len() > MAX_NAME_LEN {
        return Err(IdError::TooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }

    if let Some((position, character)) = name
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
    {
        return Err(IdError::InvalidCharacter {
            character,
            position,
        });
    }

    Ok(())
}

// =============================================================================
// Platform Network
// =============================================================================

define_name_id!(PlatformId, "platform");
define_name_id!(AttributeId, "attribute");
define_name_id!(PortId, "port");

// =============================================================================
// Events
// =============================================================================

/// Identifier of a driver event: `evt_` followed by a ULID, so ids sort by
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(Ulid);

impl EventId {
    pub const PREFIX: &'static str = "evt";

    /// Generates a fresh ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses an ID of the form `evt_{ulid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((prefix, ulid)) = s.split_once('_') else {
            return Err(IdError::MissingSeparator);
        };
        if prefix != Self::PREFIX {
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_string(),
            });
        }

        ulid.parse::<Ulid>()
            .map(Self)
            .map_err(|e| IdError::InvalidUlid(e.to_string()))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for EventId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
