//! `zones`: heating zones and their leaders.

use serde::Serialize;
use tabled::Tabled;

use tado_local_core::Zone;

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

use super::util;

#[derive(Debug, Serialize)]
struct ZoneView {
    #[serde(flatten)]
    zone: Zone,
    leader: Option<String>,
    device_count: usize,
}

#[derive(Tabled)]
struct ZoneRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    zone_type: String,
    #[tabled(rename = "Leader")]
    leader: String,
    #[tabled(rename = "Devices")]
    devices: usize,
}

impl From<&ZoneView> for ZoneRow {
    fn from(v: &ZoneView) -> Self {
        Self {
            id: v.zone.id.to_string(),
            name: v.zone.name.clone(),
            zone_type: v.zone.zone_type.clone().unwrap_or_else(|| "-".into()),
            leader: v.leader.clone().unwrap_or_else(|| "-".into()),
            devices: v.device_count,
        }
    }
}

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let bridge = util::open_offline(global).await?;
    let devices = bridge.devices();
    let views: Vec<ZoneView> = bridge
        .zones()
        .iter()
        .map(|z| ZoneView {
            leader: z
                .leader_device_id
                .and_then(|id| bridge.store().device(id))
                .map(|d| d.display_name().to_owned()),
            device_count: devices.iter().filter(|d| d.zone_id == Some(z.id)).count(),
            zone: Zone::clone(z),
        })
        .collect();
    util::close(&bridge).await;

    let out = output::render_list(global.output, &views, |v| ZoneRow::from(v), |v| {
        format!("{}\t{}", v.zone.id, v.zone.name)
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}
