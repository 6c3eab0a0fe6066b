//! `set`: one write through a short-lived gateway session.

use serde::Serialize;

use tado_local_core::{Bridge, FieldValue, TrackedField};

use crate::cli::{GlobalOpts, SetArgs};
use crate::config;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct WriteResult {
    device: String,
    serial_number: String,
    field: TrackedField,
    value: FieldValue,
}

pub async fn handle(args: SetArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = config::load(global)?;
    let resolved = config::resolve(&cfg)?;
    let SetArgs { device, field, value } = args;

    let result = Bridge::oneshot(resolved.bridge, resolved.transport, |bridge| async move {
        let device = bridge.resolve_device(&device)?;
        bridge.set_field(device.id, field, value).await?;
        Ok(WriteResult {
            device: device.display_name().to_owned(),
            serial_number: device.serial_number.clone(),
            field,
            value: FieldValue::for_field(field, value),
        })
    })
    .await?;

    let out = output::render_single(
        global.output,
        &result,
        |r| format!("Set {} on {} to {}", r.field, r.device, r.value),
        |r| format!("{}\t{}\t{}", r.serial_number, r.field, r.value),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}
