//! Shared helpers for command handlers.

use tado_local_core::{Bridge, Device, DeviceSnapshot, FieldValue, TrackedField};

use crate::cli::GlobalOpts;
use crate::config;
use crate::error::CliError;

/// Open the state file without connecting to the gateway.
pub async fn open_offline(global: &GlobalOpts) -> Result<Bridge, CliError> {
    let cfg = config::load(global)?;
    let resolved = config::resolve(&cfg)?;
    tracing::debug!(state = %resolved.bridge.state_path.display(), "opening state file");
    Ok(Bridge::open(resolved.bridge, resolved.transport).await?)
}

/// Close the state file opened by [`open_offline`].
pub async fn close(bridge: &Bridge) {
    bridge.store().db().close().await;
}

/// Zone name of a device, or `-`.
pub fn zone_name(bridge: &Bridge, device: &Device) -> String {
    device
        .zone_id
        .and_then(|z| bridge.store().zone(z))
        .map_or_else(|| "-".into(), |z| z.name.clone())
}

/// Value with a unit suffix, or `-` when unknown.
pub fn fmt_value(value: Option<FieldValue>, unit: &str) -> String {
    value.map_or_else(|| "-".into(), |v| format!("{v}{unit}"))
}

pub fn field_value(snapshot: Option<&DeviceSnapshot>, field: TrackedField) -> Option<FieldValue> {
    snapshot.and_then(|s| s.value(field))
}

/// HomeKit heating/cooling mode names.
pub fn mode_name(value: Option<FieldValue>) -> String {
    match value {
        Some(FieldValue::Int(0)) => "off".into(),
        Some(FieldValue::Int(1)) => "heat".into(),
        Some(FieldValue::Int(2)) => "cool".into(),
        Some(FieldValue::Int(3)) => "auto".into(),
        other => fmt_value(other, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_render_with_units() {
        assert_eq!(fmt_value(Some(FieldValue::Float(21.5)), "°C"), "21.5°C");
        assert_eq!(fmt_value(None, "%"), "-");
        assert_eq!(mode_name(Some(FieldValue::Int(1))), "heat");
        assert_eq!(mode_name(Some(FieldValue::Int(7))), "7");
    }
}
