//! `status`: what the state file knows about the bridge.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

use super::util;

#[derive(Debug, Serialize)]
struct StatusView {
    state_path: String,
    paired: bool,
    pairings: Vec<String>,
    devices: usize,
    zones: usize,
    last_update: Option<DateTime<Utc>>,
    cloud_token_stored: bool,
}

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let bridge = util::open_offline(global).await?;
    let status = bridge.status().await?;
    let db = bridge.store().db();
    let view = StatusView {
        state_path: bridge.config().state_path.display().to_string(),
        paired: status.paired,
        pairings: db
            .list_pairings()
            .await?
            .into_iter()
            .map(|p| p.gateway_address)
            .collect(),
        devices: status.device_count,
        zones: bridge.zones().len(),
        last_update: bridge
            .all_current()
            .iter()
            .flat_map(|s| s.fields.values().map(|f| f.updated_at))
            .max(),
        cloud_token_stored: db.load_refresh_token().await?.is_some(),
    };
    util::close(&bridge).await;

    let color = output::should_color(global.color);
    let out = output::render_single(
        global.output,
        &view,
        |v| {
            output::detail(&[
                ("State file", v.state_path.clone()),
                ("Paired", output::yes_no(v.paired, color)),
                (
                    "Gateways",
                    if v.pairings.is_empty() {
                        output::dim("none", color)
                    } else {
                        v.pairings.join(", ")
                    },
                ),
                ("Devices", v.devices.to_string()),
                ("Zones", v.zones.to_string()),
                (
                    "Last update",
                    v.last_update
                        .map_or_else(|| output::dim("never", color), |t| t.to_rfc3339()),
                ),
                ("Cloud token", output::yes_no(v.cloud_token_stored, color)),
            ])
        },
        |v| format!("paired={} devices={} zones={}", v.paired, v.devices, v.zones),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}
