// ── Command API ──
//
// Writes are routed through a single processor task so they hit the
// gateway one at a time. Callers get the outcome back over a oneshot.

use crate::bridge::mapping::TrackedCharacteristic;
use crate::error::CoreError;
use crate::model::{DeviceId, FieldValue, TrackedField, ValueKind};

/// A write request for the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetField {
        device_id: DeviceId,
        field: TrackedField,
        value: f64,
    },
}

/// Command paired with its response channel.
pub(crate) struct CommandEnvelope {
    pub command: Command,
    pub response_tx: tokio::sync::oneshot::Sender<Result<(), CoreError>>,
}

/// Check `value` against the field's kind and writable range and convert
/// it. Nothing is sent when this fails.
pub fn validate_value(
    field: TrackedField,
    value: f64,
    tracked: &TrackedCharacteristic,
) -> Result<FieldValue, CoreError> {
    let invalid = |reason: String| CoreError::InvalidFieldValue { field, reason };

    if !value.is_finite() {
        return Err(invalid(format!("{value} is not a finite number")));
    }
    if field.kind() == ValueKind::Int && value.fract() != 0.0 {
        return Err(invalid(format!("{value} is not a whole number")));
    }
    if let Some((min, max)) = tracked.range() {
        if value < min || value > max {
            return Err(invalid(format!("{value} is outside {min}..={max}")));
        }
    }
    Ok(FieldValue::for_field(field, value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tado_local_api::hap::CharacteristicId;

    use super::*;

    fn tracked(field: TrackedField, min: Option<f64>, max: Option<f64>) -> TrackedCharacteristic {
        TrackedCharacteristic {
            id: CharacteristicId::new(2, 10),
            device_id: DeviceId(1),
            field,
            readable: true,
            writable: true,
            events: true,
            min_value: min,
            max_value: max,
        }
    }

    #[test]
    fn accepts_values_inside_the_advertised_range() {
        let t = tracked(TrackedField::TargetTemperature, Some(5.0), Some(25.0));
        assert_eq!(
            validate_value(TrackedField::TargetTemperature, 21.5, &t).unwrap(),
            FieldValue::Float(21.5)
        );
        assert_eq!(
            validate_value(TrackedField::TargetTemperature, 5.0, &t).unwrap(),
            FieldValue::Float(5.0)
        );
    }

    #[test]
    fn rejects_out_of_range_and_non_finite() {
        let t = tracked(TrackedField::TargetTemperature, Some(5.0), Some(25.0));
        let err = validate_value(TrackedField::TargetTemperature, 30.0, &t).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidFieldValue { field: TrackedField::TargetTemperature, .. }
        ));
        assert!(validate_value(TrackedField::TargetTemperature, f64::NAN, &t).is_err());
    }

    #[test]
    fn integer_fields_reject_fractions() {
        let t = tracked(TrackedField::TargetHeatingCoolingState, None, None);
        assert_eq!(
            validate_value(TrackedField::TargetHeatingCoolingState, 3.0, &t).unwrap(),
            FieldValue::Int(3)
        );
        assert!(validate_value(TrackedField::TargetHeatingCoolingState, 1.5, &t).is_err());
        // Default range 0..=3 applies without advertised bounds.
        assert!(validate_value(TrackedField::TargetHeatingCoolingState, 4.0, &t).is_err());
    }
}
