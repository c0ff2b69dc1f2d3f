//! NTP v4 timestamps.
//!
//! Every timestamp crossing the driver boundary (event times, sample
//! times, write-back times and the `since` bound of attribute queries) is an
//! [`NtpTimestamp`]: an NTP era number plus the 64-bit NTP format within that
//! era, 32 bits of seconds followed by 32 bits of binary fraction. Era 0
//! starts at 1900-01-01T00:00:00Z and era 1 in February 2036.
//!
//! The canonical text form is 24 lowercase hex digits: the era as 8 digits,
//! then the 64-bit NTP value as 16. It is fixed-width, so lexical and numeric
//! order agree across eras, and it round-trips exactly through JSON. Parsing
//! also accepts the bare 16-digit NTP value as an era 0 time.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::EventError;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

const FRACTION_SCALE: u128 = 1 << 32;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Era in the high 32 bits, NTP 64-bit value in the low 64.
const VALUE_BITS: u32 = 96;
const VALUE_LIMIT: u128 = 1 << VALUE_BITS;

/// An era-qualified NTP v4 timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NtpTimestamp(u128);

impl NtpTimestamp {
    /// The NTP epoch, 1900-01-01T00:00:00Z.
    pub const ZERO: Self = Self(0);

    /// The last representable instant.
    pub const MAX: Self = Self(VALUE_LIMIT - 1);

    /// Creates an era 0 timestamp from whole seconds and a binary fraction.
    #[must_use]
    pub const fn from_parts(seconds: u32, fraction: u32) -> Self {
        Self::from_ntp64(0, ((seconds as u64) << 32) | fraction as u64)
    }

    /// Creates a timestamp from an era and the 64-bit NTP value within it.
    #[must_use]
    pub const fn from_ntp64(era: u32, ntp64: u64) -> Self {
        Self(((era as u128) << 64) | ntp64 as u128)
    }

    /// NTP era, counted from 1900.
    #[must_use]
    pub const fn era(self) -> u32 {
        (self.0 >> 64) as u32
    }

    /// The 64-bit NTP value within [`era`](Self::era), as sent on the wire.
    #[must_use]
    pub const fn ntp64(self) -> u64 {
        self.0 as u64
    }

    /// Seconds since the start of the era.
    #[must_use]
    pub const fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Fractional second, in units of 2^-32 s.
    #[must_use]
    pub const fn fraction(self) -> u32 {
        self.0 as u32
    }

    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now()).unwrap_or(Self::ZERO)
    }

    /// Converts a wall-clock time.
    ///
    /// Fails for times before 1900.
    pub fn from_datetime(dt: DateTime<Utc>) -> Result<Self, EventError> {
        let seconds = dt.timestamp() + NTP_UNIX_OFFSET_SECS as i64;
        let seconds = u64::try_from(seconds)
            .map_err(|_| EventError::TimestampOutOfRange(dt.to_rfc3339()))?;
        let nanos = u128::from(dt.timestamp_subsec_nanos());
        // Leap-second nanos (>= 1e9) fold into the last fraction of the second.
        let fraction = ((nanos * FRACTION_SCALE) / NANOS_PER_SEC).min(u32::MAX as u128);
        Ok(Self((u128::from(seconds) << 32) | fraction))
    }

    /// Converts to wall-clock time, truncating to nanosecond precision.
    ///
    /// Saturates at chrono's maximum for eras it cannot represent.
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        let total_secs = self.0 >> 32;
        let nanos = ((u128::from(self.fraction()) * NANOS_PER_SEC) / FRACTION_SCALE) as u32;
        i64::try_from(total_secs)
            .ok()
            .and_then(|secs| secs.checked_sub(NTP_UNIX_OFFSET_SECS as i64))
            .and_then(|unix_secs| DateTime::from_timestamp(unix_secs, nanos))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Adds a duration, returning `None` past [`NtpTimestamp::MAX`].
    #[must_use]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        let sum = self.0.checked_add(duration_to_units(duration))?;
        (sum < VALUE_LIMIT).then_some(Self(sum))
    }

    /// Subtracts a duration, saturating at [`NtpTimestamp::ZERO`].
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_to_units(duration)))
    }

    /// The next representable instant, or `None` at [`NtpTimestamp::MAX`].
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        (self < Self::MAX).then_some(Self(self.0 + 1))
    }

    /// Time elapsed since `earlier`, or `None` if `earlier` is later.
    #[must_use]
    pub fn duration_since(self, earlier: Self) -> Option<Duration> {
        let diff = self.0.checked_sub(earlier.0)?;
        let secs = (diff >> 32) as u64;
        let nanos = ((u128::from(diff as u32) * NANOS_PER_SEC) / FRACTION_SCALE) as u32;
        Some(Duration::new(secs, nanos))
    }
}

/// A duration in units of 2^-32 s.
fn duration_to_units(duration: Duration) -> u128 {
    let fraction = (u128::from(duration.subsec_nanos()) * FRACTION_SCALE) / NANOS_PER_SEC;
    (u128::from(duration.as_secs()) << 32) | fraction
}

impl fmt::Display for NtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:016x}", self.era(), self.ntp64())
    }
}

impl FromStr for NtpTimestamp {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EventError::InvalidTimestamp(s.to_string());
        if !matches!(s.len(), 16 | 24) || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| invalid())
    }
}

impl TryFrom<DateTime<Utc>> for NtpTimestamp {
    type Error = EventError;

    fn try_from(dt: DateTime<Utc>) -> Result<Self, Self::Error> {
        Self::from_datetime(dt)
    }
}

impl From<NtpTimestamp> for DateTime<Utc> {
    fn from(ts: NtpTimestamp) -> Self {
        ts.to_datetime()
    }
}

impl Serialize for NtpTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NtpTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
