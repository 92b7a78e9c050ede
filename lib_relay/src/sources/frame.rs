//! The frame format shared by the ingest feed, playback files and the recorder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::core::value::{SnapshotId, Value, ValueState};

/// One tick of telemetry as it travels on the wire or sits in a recording:
/// `{"tick": 42, "values": {...}, "units": {...}, "states": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub tick: SnapshotId,
    #[serde(default)]
    pub values: BTreeMap<String, Json>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub units: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub states: BTreeMap<String, ValueState>,
}

/// A single path looked up in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub raw: Json,
    pub unit: String,
    pub state: ValueState,
}

impl TelemetryFrame {
    pub fn new(tick: SnapshotId) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Builder used by tests and the recorder.
    pub fn with_value(mut self, path: impl Into<String>, raw: impl Into<Json>, unit: &str) -> Self {
        let path = path.into();
        if !unit.is_empty() {
            self.units.insert(path.clone(), unit.to_string());
        }
        self.values.insert(path, raw.into());
        self
    }

    pub fn with_state(mut self, path: impl Into<String>, state: ValueState) -> Self {
        self.states.insert(path.into(), state);
        self
    }

    /// Rebuilds a frame from the native-unit values of one dispatched tick.
    /// Error values are left out.
    pub fn from_values(tick: SnapshotId, values: &BTreeMap<String, Value>) -> Self {
        let mut frame = Self::new(tick);
        for (path, value) in values {
            if value.state == ValueState::Error {
                continue;
            }
            frame.values.insert(path.clone(), value.raw.clone());
            if !value.uom.is_empty() {
                frame.units.insert(path.clone(), value.uom.clone());
            }
            if value.state != ValueState::Normal {
                frame.states.insert(path.clone(), value.state);
            }
        }
        frame
    }

    pub fn reading(&self, path: &str) -> Option<Reading> {
        let raw = self.values.get(path)?;
        Some(Reading {
            raw: raw.clone(),
            unit: self.units.get(path).cloned().unwrap_or_default(),
            state: self.states.get(path).copied().unwrap_or_default(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_frame() {
        let frame: TelemetryFrame =
            serde_json::from_str(r#"{"tick": 7, "values": {"/Car/ME/Gear": 3}}"#).unwrap();
        let reading = frame.reading("/Car/ME/Gear").unwrap();
        assert_eq!(reading.raw, json!(3));
        assert_eq!(reading.unit, "");
        assert_eq!(reading.state, ValueState::Normal);
        assert!(frame.reading("/Car/ME/Speed").is_none());
    }

    #[test]
    fn from_values_keeps_units_and_skips_errors() {
        let mut values = BTreeMap::new();
        values.insert(
            "/Car/ME/Speed".to_string(),
            Value::new(json!(33.5), "m/s", "33.5", ValueState::Normal, 3),
        );
        values.insert(
            "/Car/ME/Rpm".to_string(),
            Value::new(json!(8100), "rpm", "8100", ValueState::OverLimit, 3),
        );
        values.insert("/Car/ME/Bogus".to_string(), Value::error("unknown", 3));

        let frame = TelemetryFrame::from_values(3, &values);
        assert_eq!(frame.values.len(), 2);
        assert_eq!(frame.units["/Car/ME/Speed"], "m/s");
        assert_eq!(frame.states["/Car/ME/Rpm"], ValueState::OverLimit);
        assert!(!frame.states.contains_key("/Car/ME/Speed"));

        let line = serde_json::to_string(&frame).unwrap();
        let back: TelemetryFrame = serde_json::from_str(&line).unwrap();
        assert_eq!(back, frame);
    }
}
