//! `devices`: registered devices with their latest readings.

use serde::Serialize;
use tabled::Tabled;

use tado_local_core::{Device, DeviceSnapshot, TrackedField};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

use super::util::{self, fmt_value, mode_name};

#[derive(Debug, Serialize)]
struct DeviceView {
    #[serde(flatten)]
    device: Device,
    zone: Option<String>,
    state: Option<DeviceSnapshot>,
}

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Serial")]
    serial: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Zone")]
    zone: String,
    #[tabled(rename = "Current")]
    current: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Humidity")]
    humidity: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Battery")]
    battery: String,
}

impl From<&DeviceView> for DeviceRow {
    fn from(v: &DeviceView) -> Self {
        let d = &v.device;
        let value = |field| util::field_value(v.state.as_ref(), field);
        Self {
            id: d.id.to_string(),
            serial: d.serial_number.clone(),
            name: d.display_name().to_owned(),
            kind: d.kind.to_string(),
            zone: v.zone.clone().unwrap_or_else(|| "-".into()),
            current: fmt_value(value(TrackedField::CurrentTemperature), "°C"),
            target: fmt_value(value(TrackedField::TargetTemperature), "°C"),
            humidity: fmt_value(value(TrackedField::Humidity), "%"),
            mode: mode_name(value(TrackedField::TargetHeatingCoolingState)),
            battery: d.battery_state.clone().unwrap_or_else(|| "-".into()),
        }
    }
}

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let bridge = util::open_offline(global).await?;
    let views: Vec<DeviceView> = bridge
        .devices()
        .iter()
        .map(|d| DeviceView {
            zone: d.zone_id.map(|_| util::zone_name(&bridge, d)),
            state: bridge.current_state(d.id),
            device: Device::clone(d),
        })
        .collect();
    util::close(&bridge).await;

    let out = output::render_list(global.output, &views, |v| DeviceRow::from(v), |v| {
        format!("{}\t{}", v.device.id, v.device.serial_number)
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}
