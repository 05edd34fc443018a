//! Events delivered to the ingress API and the builder that derives them
//! from decoded sensor records.

use crate::mac_address::{AddressFormatError, MacAddress};
use crate::record::{Reading, SensorRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

/// Label used for temperature events unless configured otherwise.
pub const DEFAULT_TEMPERATURE_UNIT: &str = "C";

/// Label used for humidity events.
pub const HUMIDITY_UNIT: &str = "% RH";

/// The two measurement kinds a HumiTemp record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Temperature,
    Humidity,
}

impl EventKind {
    /// Kinds in the order they are built and delivered.
    pub const ALL: [EventKind; 2] = [EventKind::Temperature, EventKind::Humidity];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Temperature => "Temperature",
            EventKind::Humidity => "Humidity",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reading as sent to `/v1/iot/events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub address: String,
    pub rssi: i16,
    pub id: EventKind,
    #[serde(rename = "nodeID")]
    pub node_id: String,
    #[serde(rename = "timestamp_iso8601", serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub sensor_value: f64,
    pub units: String,
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Builds events from decoded records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBuilder {
    temperature_unit: String,
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPERATURE_UNIT)
    }
}

impl EventBuilder {
    /// Create a builder. Only the first character of `temperature_unit` is
    /// used as the label; an empty string falls back to the default.
    pub fn new(temperature_unit: &str) -> Self {
        let temperature_unit = temperature_unit
            .chars()
            .next()
            .map(String::from)
            .unwrap_or_else(|| DEFAULT_TEMPERATURE_UNIT.to_string());
        Self { temperature_unit }
    }

    pub fn temperature_unit(&self) -> &str {
        &self.temperature_unit
    }

    /// Build the event for one measurement kind, stamped with the current time.
    pub fn build(
        &self,
        record: &SensorRecord,
        kind: EventKind,
        rssi: i16,
    ) -> Result<Event, AddressFormatError> {
        self.build_at(record, kind, rssi, Utc::now())
    }

    /// Build the temperature and humidity events for a record, in that order.
    pub fn build_all(
        &self,
        record: &SensorRecord,
        rssi: i16,
    ) -> Result<[Event; 2], AddressFormatError> {
        let now = Utc::now();
        Ok([
            self.build_at(record, EventKind::Temperature, rssi, now)?,
            self.build_at(record, EventKind::Humidity, rssi, now)?,
        ])
    }

    fn build_at(
        &self,
        record: &SensorRecord,
        kind: EventKind,
        rssi: i16,
        timestamp: DateTime<Utc>,
    ) -> Result<Event, AddressFormatError> {
        let node_id = MacAddress::try_from(&record.address[..])?.to_string();
        let (reading, units): (&Reading, &str) = match kind {
            EventKind::Temperature => (&record.temperature, self.temperature_unit.as_str()),
            EventKind::Humidity => (&record.humidity, HUMIDITY_UNIT),
        };

        Ok(Event {
            address: node_id.clone(),
            rssi,
            id: kind,
            node_id,
            timestamp,
            sensor_value: reading.value(),
            units: units.to_string(),
        })
    }
}
