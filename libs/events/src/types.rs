//! Driver event definitions.
//!
//! A platform driver pushes [`DriverEvent`]s to its supervising agent. Events
//! are immutable once constructed: fields are private and only readable
//! through accessors.

use std::fmt;

use platnet_id::{AttributeId, EventId, PlatformId};
use serde::{Deserialize, Serialize};

use crate::{EventError, NtpTimestamp};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const ATTRIBUTE_VALUE: &str = "attribute_value";
    pub const ALARM: &str = "alarm";
}

// =============================================================================
// Attribute Samples
// =============================================================================

/// Value of a platform attribute. The platform network decides its shape.
pub type AttributeValue = serde_json::Value;

/// One time-stamped reading of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSample {
    pub value: AttributeValue,
    pub timestamp: NtpTimestamp,
}

impl AttributeSample {
    pub fn new(value: impl Into<AttributeValue>, timestamp: NtpTimestamp) -> Self {
        Self {
            value: value.into(),
            timestamp,
        }
    }
}

// =============================================================================
// Alarm Enums
// =============================================================================

/// Kind of abnormal condition reported by a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmType {
    PowerFault,
    GroundFault,
    OverTemperature,
    OverCurrent,
    UnderVoltage,
    LeakDetected,
    /// Raised by the driver itself when the platform stops answering polls.
    CommunicationLost,
    /// Raised by the driver itself when polls succeed again.
    CommunicationRestored,
    /// A kind this version does not recognize.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for AlarmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlarmType::PowerFault => "power_fault",
            AlarmType::GroundFault => "ground_fault",
            AlarmType::OverTemperature => "over_temperature",
            AlarmType::OverCurrent => "over_current",
            AlarmType::UnderVoltage => "under_voltage",
            AlarmType::LeakDetected => "leak_detected",
            AlarmType::CommunicationLost => "communication_lost",
            AlarmType::CommunicationRestored => "communication_restored",
            AlarmType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Alarm severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmSeverity {
    Info,
    Warning,
    Critical,
}

/// Descriptor of one alarm occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmInstance {
    /// Identifier assigned by the platform network (or the driver).
    pub instance_id: String,

    /// Platform that raised the alarm.
    pub platform_id: PlatformId,

    pub severity: AlarmSeverity,

    pub description: String,

    /// Backend-specific details.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl fmt::Display for AlarmInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{instance_id={:?}, platform_id={:?}, severity={:?}, description={:?}}}",
            self.instance_id,
            self.platform_id.as_str(),
            self.severity,
            self.description
        )
    }
}

// =============================================================================
// Events
// =============================================================================

/// Notifies a retrieved value of a platform attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValueEvent {
    event_id: EventId,
    timestamp: NtpTimestamp,
    platform_id: PlatformId,
    attr_id: AttributeId,
    value: AttributeValue,
}

impl AttributeValueEvent {
    pub fn new(
        timestamp: NtpTimestamp,
        platform_id: PlatformId,
        attr_id: AttributeId,
        value: AttributeValue,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp,
            platform_id,
            attr_id,
            value,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn timestamp(&self) -> NtpTimestamp {
        self.timestamp
    }

    pub fn platform_id(&self) -> &PlatformId {
        &self.platform_id
    }

    pub fn attr_id(&self) -> &AttributeId {
        &self.attr_id
    }

    pub fn value(&self) -> &AttributeValue {
        &self.value
    }
}

impl fmt::Display for AttributeValueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AttributeValueEvent(platform_id={:?}, attr_id={:?}, value={}, ts={})",
            self.platform_id.as_str(),
            self.attr_id.as_str(),
            self.value,
            self.timestamp
        )
    }
}

/// Notifies an alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    event_id: EventId,
    timestamp: NtpTimestamp,
    alarm_type: AlarmType,
    alarm_instance: AlarmInstance,
}

impl AlarmEvent {
    pub fn new(timestamp: NtpTimestamp, alarm_type: AlarmType, alarm_instance: AlarmInstance) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp,
            alarm_type,
            alarm_instance,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn timestamp(&self) -> NtpTimestamp {
        self.timestamp
    }

    pub fn alarm_type(&self) -> AlarmType {
        self.alarm_type
    }

    pub fn alarm_instance(&self) -> &AlarmInstance {
        &self.alarm_instance
    }
}

impl fmt::Display for AlarmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AlarmEvent(alarm_type={}, alarm_instance={}, ts={})",
            self.alarm_type, self.alarm_instance, self.timestamp
        )
    }
}

/// An event generated by a platform driver.
///
/// New variants may be added; match with a wildcard arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DriverEvent {
    AttributeValue(AttributeValueEvent),
    Alarm(AlarmEvent),
}

impl DriverEvent {
    /// Builds an attribute value event.
    pub fn attribute_value(
        timestamp: NtpTimestamp,
        platform_id: PlatformId,
        attr_id: AttributeId,
        value: AttributeValue,
    ) -> Self {
        DriverEvent::AttributeValue(AttributeValueEvent::new(
            timestamp,
            platform_id,
            attr_id,
            value,
        ))
    }

    /// Builds an alarm event.
    pub fn alarm(timestamp: NtpTimestamp, alarm_type: AlarmType, alarm_instance: AlarmInstance) -> Self {
        DriverEvent::Alarm(AlarmEvent::new(timestamp, alarm_type, alarm_instance))
    }

    pub fn event_id(&self) -> EventId {
        match self {
            DriverEvent::AttributeValue(e) => e.event_id(),
            DriverEvent::Alarm(e) => e.event_id(),
        }
    }

    pub fn timestamp(&self) -> NtpTimestamp {
        match self {
            DriverEvent::AttributeValue(e) => e.timestamp(),
            DriverEvent::Alarm(e) => e.timestamp(),
        }
    }

    /// The event type name, one of [`event_types`].
    pub fn event_type(&self) -> &'static str {
        match self {
            DriverEvent::AttributeValue(_) => event_types::ATTRIBUTE_VALUE,
            DriverEvent::Alarm(_) => event_types::ALARM,
        }
    }

    /// Platform the event is about.
    pub fn platform_id(&self) -> &PlatformId {
        match self {
            DriverEvent::AttributeValue(e) => e.platform_id(),
            DriverEvent::Alarm(e) => &e.alarm_instance().platform_id,
        }
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<AttributeValueEvent> for DriverEvent {
    fn from(event: AttributeValueEvent) -> Self {
        DriverEvent::AttributeValue(event)
    }
}

impl From<AlarmEvent> for DriverEvent {
    fn from(event: AlarmEvent) -> Self {
        DriverEvent::Alarm(event)
    }
}

impl fmt::Display for DriverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverEvent::AttributeValue(e) => fmt::Display::fmt(e, f),
            DriverEvent::Alarm(e) => fmt::Display::fmt(e, f),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn platform(id: &str) -> PlatformId {
        id.parse().unwrap()
    }

    fn alarm_instance() -> AlarmInstance {
        AlarmInstance {
            instance_id: "alm-0001".to_string(),
            platform_id: platform("LJ01D"),
            severity: AlarmSeverity::Critical,
            description: "ground fault on port 1".to_string(),
            details: json!({ "port": "LJ01D_port_1" }),
        }
    }

    #[test]
    fn test_alarm_type_serialization() {
        assert_eq!(
            serde_json::to_string(&AlarmType::GroundFault).unwrap(),
            "\"ground_fault\""
        );
        assert_eq!(
            serde_json::to_string(&AlarmType::CommunicationLost).unwrap(),
            "\"communication_lost\""
        );
    }

    #[test]
    fn test_alarm_type_unknown_fallback() {
        let parsed: AlarmType = serde_json::from_str("\"seismic_event\"").unwrap();
        assert_eq!(parsed, AlarmType::Unknown);
    }

    #[test]
    fn test_attribute_value_event_json() {
        let ts = NtpTimestamp::from_parts(3_913_056_000, 0);
        let event = DriverEvent::attribute_value(
            ts,
            platform("Node1D"),
            "input_voltage".parse().unwrap(),
            json!(12.5),
        );

        let json = event.to_json().unwrap();
        assert!(json.contains("\"event_type\":\"attribute_value\""));
        assert!(json.contains("\"attr_id\":\"input_voltage\""));

        let parsed = DriverEvent::from_json(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.timestamp(), ts);
    }

    #[test]
    fn test_alarm_event_json() {
        let event = DriverEvent::alarm(
            NtpTimestamp::from_parts(10, 0),
            AlarmType::GroundFault,
            alarm_instance(),
        );

        let json = event.to_json().unwrap();
        assert!(json.contains("\"event_type\":\"alarm\""));
        assert!(json.contains("\"alarm_type\":\"ground_fault\""));
        assert_eq!(DriverEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn test_event_accessors() {
        let event = DriverEvent::alarm(
            NtpTimestamp::from_parts(10, 0),
            AlarmType::PowerFault,
            alarm_instance(),
        );
        assert_eq!(event.event_type(), event_types::ALARM);
        assert_eq!(event.platform_id().as_str(), "LJ01D");

        match &event {
            DriverEvent::Alarm(alarm) => {
                assert_eq!(alarm.alarm_type(), AlarmType::PowerFault);
                assert_eq!(alarm.alarm_instance().severity, AlarmSeverity::Critical);
            }
            other => panic!("unexpected event: {other}"),
        }
    }

    #[test]
    fn test_each_event_gets_fresh_id() {
        let ts = NtpTimestamp::from_parts(10, 0);
        let a = AttributeValueEvent::new(ts, platform("P1"), "temp".parse().unwrap(), json!(1));
        let b = AttributeValueEvent::new(ts, platform("P1"), "temp".parse().unwrap(), json!(1));
        assert_ne!(a.event_id(), b.event_id());
    }

    #[test]
    fn test_display() {
        let event = AttributeValueEvent::new(
            NtpTimestamp::from_parts(1, 0),
            platform("P1"),
            "temp".parse().unwrap(),
            json!(3),
        );
        assert_eq!(
            event.to_string(),
            "AttributeValueEvent(platform_id=\"P1\", attr_id=\"temp\", value=3, ts=0000000100000000)"
        );
    }

    #[test]
    fn test_from_json_rejects_unknown_event_type() {
        let result = DriverEvent::from_json(r#"{"event_type":"reboot"}"#);
        assert!(matches!(result, Err(EventError::Serialization(_))));
    }
}
