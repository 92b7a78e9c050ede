//! # Telemetry Values
//!
//! A [`Value`] is what a point query against the telemetry source yields: the raw
//! reading, the unit it is expressed in, a display string and a qualitative state.
//! Values are cloned when they cross component boundaries; nobody mutates a
//! `Value` that another component can see.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Identifier of one source tick. Only ever compared for "newer than".
pub type SnapshotId = u64;

/// Qualitative state attached to every value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueState {
    /// Reading is within its normal operating range.
    #[default]
    Normal,
    /// Reading is approaching a limit.
    Warning,
    /// Reading is past its limit (e.g. rpm at the limiter).
    OverLimit,
    /// The query failed; the formatted string carries the reason.
    Error,
}

/// # Value
///
/// One reading of one source path.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// The raw reading (number, string, bool or null).
    pub raw: Json,
    /// Unit-of-measure code the raw reading is expressed in; empty for unitless values.
    pub uom: String,
    /// Display string produced with the requested format and locale.
    pub formatted: String,
    /// Qualitative state of the reading.
    pub state: ValueState,
    /// Tick the reading was taken at.
    pub changed_at: SnapshotId,
    /// Set while the value has changed since it was last served.
    pub dirty: bool,
    /// Fire-once command result; the owning subscription is dropped after it is served.
    pub one_shot: bool,
}

impl Value {
    /// Creates a clean (non-dirty, repeatable) value.
    pub fn new(
        raw: Json,
        uom: impl Into<String>,
        formatted: impl Into<String>,
        state: ValueState,
        changed_at: SnapshotId,
    ) -> Self {
        Self {
            raw,
            uom: uom.into(),
            formatted: formatted.into(),
            state,
            changed_at,
            dirty: false,
            one_shot: false,
        }
    }

    /// An error-state value carrying `message` as its display string.
    pub fn error(message: impl Into<String>, changed_at: SnapshotId) -> Self {
        Self::new(Json::Null, "", message, ValueState::Error, changed_at)
    }

    /// Marks the value as a fire-once command result.
    pub fn into_one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Structural comparison used for dirty tracking.
    ///
    /// Raw reading, state and unit must match. The display string only counts for
    /// error values, where it is the only place the fault message lives.
    pub fn same_reading(&self, other: &Value) -> bool {
        if self.raw != other.raw || self.state != other.state || self.uom != other.uom {
            return false;
        }
        self.state != ValueState::Error || self.formatted == other.formatted
    }

    /// The wire view of this value.
    pub fn view(&self) -> ValueView {
        ValueView {
            value: self.raw.clone(),
            value_formatted: self.formatted.clone(),
            state: self.state,
            uom: self.uom.clone(),
        }
    }
}

/// Serialized shape of a value inside a diff:
/// `{"Value":..., "ValueFormatted":..., "State":..., "UOM":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ValueView {
    pub value: Json,
    pub value_formatted: String,
    pub state: ValueState,
    #[serde(rename = "UOM")]
    pub uom: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_reading_ignores_formatting() {
        let a = Value::new(json!(120), "km/h", "120", ValueState::Normal, 1);
        let b = Value::new(json!(120), "km/h", "120,0", ValueState::Normal, 2);
        assert!(a.same_reading(&b));
    }

    #[test]
    fn same_reading_honors_state_and_unit() {
        let a = Value::new(json!(120), "km/h", "120", ValueState::Normal, 1);
        let warn = Value::new(json!(120), "km/h", "120", ValueState::Warning, 1);
        let mph = Value::new(json!(120), "mph", "120", ValueState::Normal, 1);
        assert!(!a.same_reading(&warn));
        assert!(!a.same_reading(&mph));
    }

    #[test]
    fn error_values_compare_messages() {
        let a = Value::error("no such path", 3);
        let b = Value::error("plugin crashed", 3);
        assert!(!a.same_reading(&b));
        assert!(a.same_reading(&Value::error("no such path", 9)));
    }

    #[test]
    fn view_uses_wire_field_names() {
        let v = Value::new(json!(7.5), "bar", "7.5", ValueState::OverLimit, 1);
        let encoded = serde_json::to_value(v.view()).unwrap();
        assert_eq!(
            encoded,
            json!({"Value": 7.5, "ValueFormatted": "7.5", "State": "OverLimit", "UOM": "bar"})
        );
    }
}
