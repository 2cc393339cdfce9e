use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Device identifier
pub type DeviceId = String;

/// Well-known attribute names used on the MyHarvia wire
pub mod attr {
    pub const ACTIVE: &str = "active";
    pub const LIGHT: &str = "light";
    pub const FAN: &str = "fan";
    pub const STEAM_ENABLED: &str = "steamEn";
    pub const AROMA_ENABLED: &str = "aromaEn";
    pub const AUTO_LIGHT: &str = "autoLight";
    pub const AUTO_FAN: &str = "autoFan";
    pub const DEHUMIDIFIER: &str = "dehumEn";
    pub const TARGET_TEMP: &str = "targetTemp";
    pub const TARGET_RH: &str = "targetRh";
    pub const AROMA_LEVEL: &str = "aromaLevel";
    pub const ON_TIME: &str = "onTime";
    pub const TEMPERATURE: &str = "temperature";
    pub const HUMIDITY: &str = "humidity";
    pub const HEAT_ON: &str = "heatOn";
    pub const STEAM_ON: &str = "steamOn";
    pub const REMAINING_TIME: &str = "remainingTime";
    pub const HEAT_UP_TIME: &str = "heatUpTime";
    pub const WIFI_RSSI: &str = "wifiRSSI";
    pub const STATUS_CODES: &str = "statusCodes";
    pub const DOOR_OPEN: &str = "doorOpen";
    pub const ENERGY_KWH: &str = "energyKwh";
    /// Not a wire attribute: reported in change notifications when a
    /// device's display name changes
    pub const DISPLAY_NAME: &str = "displayName";

    // Diagnostic relay/runtime counters (session and lifetime)
    pub const PH1_RELAY_COUNTER: &str = "ph1RelayCounter";
    pub const PH2_RELAY_COUNTER: &str = "ph2RelayCounter";
    pub const PH3_RELAY_COUNTER: &str = "ph3RelayCounter";
    pub const PH1_RELAY_COUNTER_LT: &str = "ph1RelayCounterLT";
    pub const PH2_RELAY_COUNTER_LT: &str = "ph2RelayCounterLT";
    pub const PH3_RELAY_COUNTER_LT: &str = "ph3RelayCounterLT";
    pub const STEAM_ON_COUNTER: &str = "steamOnCounter";
    pub const STEAM_ON_COUNTER_LT: &str = "steamOnCounterLT";
    pub const HEAT_ON_COUNTER: &str = "heatOnCounter";
    pub const HEAT_ON_COUNTER_LT: &str = "heatOnCounterLT";
}

/// Typed value of a single device attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Convert a raw JSON value into a typed attribute value
    ///
    /// The cloud encodes booleans as `0`/`1` integers in state documents,
    /// so integer-to-bool coercion is left to the caller's descriptor.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(Self::Float)
                }
            }
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Encode for an outbound state-change request
    ///
    /// Booleans go out as `0`/`1`, matching what the cloud expects.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::json!(*b as i64),
            Self::Int(i) => serde_json::json!(i),
            Self::Float(f) => serde_json::json!(f),
            Self::Text(s) => serde_json::json!(s),
        }
    }
}

/// Where an accepted update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Delivered by the push channel
    Push,
    /// Fetched by the poll client
    Poll,
    /// Locally applied ahead of server confirmation
    Optimistic,
}

impl UpdateSource {
    /// Tie-break rule for equal timestamps: push data is considered
    /// authoritative over poll data
    pub fn outranks(self, other: UpdateSource) -> bool {
        matches!((self, other), (UpdateSource::Push, UpdateSource::Poll))
    }
}

/// One attribute's current canonical value with its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRecord {
    pub value: AttributeValue,
    pub updated_at: DateTime<Utc>,
    pub source: UpdateSource,
}

/// Canonical state of one sauna device
///
/// Owned by the reconciler; consumers receive cloned snapshots. Attributes
/// absent from the map have never been reported by this device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub display_name: String,
    pub attributes: BTreeMap<String, AttributeRecord>,
    pub discovered_at: DateTime<Utc>,
}

impl DeviceState {
    pub fn new(device_id: DeviceId, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            display_name: "Harvia Sauna".to_string(),
            attributes: BTreeMap::new(),
            discovered_at: now,
        }
    }

    /// Get the full record for an attribute
    pub fn record(&self, name: &str) -> Option<&AttributeRecord> {
        self.attributes.get(name)
    }

    /// Get the current value of an attribute
    pub fn value(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name).map(|r| &r.value)
    }

    /// Whether an attribute currently has a usable value
    ///
    /// An attribute the device never reported, or whose last update is
    /// older than the staleness window, is unavailable: consumers should
    /// show "unknown" rather than a frozen stale reading.
    pub fn attribute_available(
        &self,
        name: &str,
        staleness_window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        match self.attributes.get(name) {
            Some(record) => {
                let age = now.signed_duration_since(record.updated_at);
                age.to_std().map_or(true, |age| age <= staleness_window)
            }
            None => false,
        }
    }

    /// Timestamp of the most recent accepted update, if any
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.attributes.values().map(|r| r.updated_at).max()
    }
}

/// Device entry from the account's device tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub display_name: String,
}

/// Shape of a writable attribute's value domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// On/off toggle (sent as 0/1)
    Toggle,
    /// Integer with an inclusive range
    Range { min: i64, max: i64 },
}

/// Declared domain of a writable attribute
#[derive(Debug, Clone, Copy)]
pub struct AttributeDescriptor {
    pub name: &'static str,
    pub kind: AttributeKind,
}

/// All attributes that accept commands, with their value domains
///
/// Ranges follow the heater's controls: temperature in Celsius, humidity
/// and aroma level in percent, on-time in minutes.
pub const WRITABLE_ATTRIBUTES: &[AttributeDescriptor] = &[
    AttributeDescriptor { name: attr::ACTIVE, kind: AttributeKind::Toggle },
    AttributeDescriptor { name: attr::LIGHT, kind: AttributeKind::Toggle },
    AttributeDescriptor { name: attr::FAN, kind: AttributeKind::Toggle },
    AttributeDescriptor { name: attr::STEAM_ENABLED, kind: AttributeKind::Toggle },
    AttributeDescriptor { name: attr::AROMA_ENABLED, kind: AttributeKind::Toggle },
    AttributeDescriptor { name: attr::AUTO_LIGHT, kind: AttributeKind::Toggle },
    AttributeDescriptor { name: attr::AUTO_FAN, kind: AttributeKind::Toggle },
    AttributeDescriptor { name: attr::DEHUMIDIFIER, kind: AttributeKind::Toggle },
    AttributeDescriptor { name: attr::TARGET_TEMP, kind: AttributeKind::Range { min: 40, max: 110 } },
    AttributeDescriptor { name: attr::TARGET_RH, kind: AttributeKind::Range { min: 0, max: 100 } },
    AttributeDescriptor { name: attr::AROMA_LEVEL, kind: AttributeKind::Range { min: 0, max: 100 } },
    AttributeDescriptor { name: attr::ON_TIME, kind: AttributeKind::Range { min: 0, max: 720 } },
];

/// Look up the descriptor for a writable attribute
pub fn writable_descriptor(name: &str) -> Option<&'static AttributeDescriptor> {
    WRITABLE_ATTRIBUTES.iter().find(|d| d.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn value_coercions() {
        assert_eq!(AttributeValue::Int(1).as_bool(), Some(true));
        assert_eq!(AttributeValue::Int(0).as_bool(), Some(false));
        assert_eq!(AttributeValue::Bool(true).as_i64(), Some(1));
        assert_eq!(AttributeValue::Int(62).as_f64(), Some(62.0));
        assert_eq!(AttributeValue::Text("x".into()).as_bool(), None);
    }

    #[test]
    fn bool_goes_out_as_int() {
        assert_eq!(AttributeValue::Bool(true).to_wire(), serde_json::json!(1));
        assert_eq!(AttributeValue::Bool(false).to_wire(), serde_json::json!(0));
    }

    #[test]
    fn push_outranks_poll_only() {
        assert!(UpdateSource::Push.outranks(UpdateSource::Poll));
        assert!(!UpdateSource::Poll.outranks(UpdateSource::Push));
        assert!(!UpdateSource::Push.outranks(UpdateSource::Push));
        assert!(!UpdateSource::Optimistic.outranks(UpdateSource::Poll));
    }

    #[test]
    fn unreported_attribute_is_unavailable() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let state = DeviceState::new("sauna-1".into(), now);
        assert!(!state.attribute_available(attr::TEMPERATURE, Duration::from_secs(360), now));
    }

    #[test]
    fn stale_attribute_is_unavailable() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut state = DeviceState::new("sauna-1".into(), t0);
        state.attributes.insert(
            attr::TEMPERATURE.to_string(),
            AttributeRecord {
                value: AttributeValue::Int(62),
                updated_at: t0,
                source: UpdateSource::Poll,
            },
        );

        let window = Duration::from_secs(360);
        let fresh = t0 + chrono::Duration::seconds(300);
        let stale = t0 + chrono::Duration::seconds(361);
        assert!(state.attribute_available(attr::TEMPERATURE, window, fresh));
        assert!(!state.attribute_available(attr::TEMPERATURE, window, stale));
    }

    #[test]
    fn writable_table_lookup() {
        assert!(writable_descriptor(attr::TARGET_TEMP).is_some());
        assert!(writable_descriptor(attr::TEMPERATURE).is_none());
        assert!(writable_descriptor("nonsense").is_none());
    }
}
