// ── Tracked fields ──
//
// The closed set of characteristics the bridge reconciles and records.
// Each maps to exactly one HomeKit characteristic type and one history
// column.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use tado_local_api::hap::uuid;

/// A characteristic tracked in current state and history.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrackedField {
    CurrentTemperature,
    TargetTemperature,
    CurrentHeatingCoolingState,
    TargetHeatingCoolingState,
    HeatingThresholdTemperature,
    CoolingThresholdTemperature,
    TemperatureDisplayUnits,
    Humidity,
    TargetHumidity,
    BatteryLevel,
    StatusLowBattery,
    ActiveState,
    ValvePosition,
}

/// Numeric representation of a field's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Float,
    Int,
}

impl TrackedField {
    pub const ALL: [Self; 13] = [
        Self::CurrentTemperature,
        Self::TargetTemperature,
        Self::CurrentHeatingCoolingState,
        Self::TargetHeatingCoolingState,
        Self::HeatingThresholdTemperature,
        Self::CoolingThresholdTemperature,
        Self::TemperatureDisplayUnits,
        Self::Humidity,
        Self::TargetHumidity,
        Self::BatteryLevel,
        Self::StatusLowBattery,
        Self::ActiveState,
        Self::ValvePosition,
    ];

    /// Short HomeKit type.
    pub fn short_type(self) -> &'static str {
        match self {
            Self::CurrentTemperature => "11",
            Self::TargetTemperature => "35",
            Self::CurrentHeatingCoolingState => "F",
            Self::TargetHeatingCoolingState => "33",
            Self::HeatingThresholdTemperature => "12",
            Self::CoolingThresholdTemperature => "D",
            Self::TemperatureDisplayUnits => "36",
            Self::Humidity => "10",
            Self::TargetHumidity => "34",
            Self::BatteryLevel => "68",
            Self::StatusLowBattery => "79",
            Self::ActiveState => "B0",
            Self::ValvePosition => "4F",
        }
    }

    /// Resolve a characteristic type (short or long form).
    pub fn from_char_type(char_type: &str) -> Option<Self> {
        let short = uuid::short_form(char_type)?;
        Self::ALL.into_iter().find(|f| f.short_type() == short)
    }

    /// Column name in `device_state_history`.
    pub fn column(self) -> &'static str {
        self.into()
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Self::CurrentTemperature
            | Self::TargetTemperature
            | Self::HeatingThresholdTemperature
            | Self::CoolingThresholdTemperature
            | Self::Humidity
            | Self::TargetHumidity => ValueKind::Float,
            _ => ValueKind::Int,
        }
    }

    /// Fields the bridge accepts in `set_field`.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Self::TargetTemperature | Self::TargetHeatingCoolingState | Self::TargetHumidity
        )
    }

    /// Fields that do not push reliably and are re-read on the fast cadence.
    pub fn is_fast_polled(self) -> bool {
        matches!(self, Self::Humidity | Self::TargetHumidity)
    }

    /// Range used when the entity tree carries no `minValue`/`maxValue`.
    pub fn default_range(self) -> Option<(f64, f64)> {
        match self {
            Self::TargetTemperature => Some((10.0, 38.0)),
            Self::TargetHeatingCoolingState => Some((0.0, 3.0)),
            Self::TargetHumidity => Some((0.0, 100.0)),
            _ => None,
        }
    }
}

// ── FieldValue ───────────────────────────────────────────────────────

/// A non-null field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
}

impl FieldValue {
    /// Convert a gateway JSON value for `field`. `None` for null or
    /// anything non-numeric.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_json(field: TrackedField, value: &serde_json::Value) -> Option<Self> {
        let number = match value {
            serde_json::Value::Bool(b) => f64::from(u8::from(*b)),
            serde_json::Value::Number(n) => n.as_f64()?,
            _ => return None,
        };
        if !number.is_finite() {
            return None;
        }
        Some(match field.kind() {
            ValueKind::Float => Self::Float(number),
            ValueKind::Int => Self::Int(number.round() as i64),
        })
    }

    /// Build a value for `field` from a number.
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_field(field: TrackedField, number: f64) -> Self {
        match field.kind() {
            ValueKind::Float => Self::Float(number),
            ValueKind::Int => Self::Int(number.round() as i64),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn to_json(self) -> serde_json::Value {
        match self {
            Self::Int(i) => serde_json::Value::from(i),
            Self::Float(f) => serde_json::Value::from(f),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}
