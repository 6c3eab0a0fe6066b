//! `history`: stored buckets for one device, newest first.

use tabled::Tabled;

use tado_local_core::{HistoryRange, HistoryRecord, TrackedField};

use crate::cli::{GlobalOpts, HistoryArgs};
use crate::error::CliError;
use crate::output;

use super::util::{self, fmt_value, mode_name};

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Bucket (UTC)")]
    bucket: String,
    #[tabled(rename = "Current")]
    current: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Humidity")]
    humidity: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Heating")]
    heating: String,
    #[tabled(rename = "Valve")]
    valve: String,
}

impl From<&HistoryRecord> for HistoryRow {
    fn from(r: &HistoryRecord) -> Self {
        Self {
            bucket: bucket_label(r),
            current: fmt_value(r.value(TrackedField::CurrentTemperature), "°C"),
            target: fmt_value(r.value(TrackedField::TargetTemperature), "°C"),
            humidity: fmt_value(r.value(TrackedField::Humidity), "%"),
            mode: mode_name(r.value(TrackedField::TargetHeatingCoolingState)),
            heating: mode_name(r.value(TrackedField::CurrentHeatingCoolingState)),
            valve: fmt_value(r.value(TrackedField::ValvePosition), "%"),
        }
    }
}

fn bucket_label(r: &HistoryRecord) -> String {
    r.bucket_start()
        .map_or_else(|| r.bucket.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// `bucket field=value ...`, one record per line.
fn plain_line(r: &HistoryRecord) -> String {
    let fields: Vec<String> = r.fields.iter().map(|(f, v)| format!("{f}={v}")).collect();
    format!("{}\t{}", r.bucket, fields.join(" "))
}

fn range(args: &HistoryArgs) -> Result<HistoryRange, CliError> {
    if let (Some(start), Some(end)) = (args.start, args.end) {
        if start > end {
            return Err(CliError::Validation {
                field: "--start".into(),
                reason: "must not be after --end".into(),
            });
        }
    }
    Ok(HistoryRange {
        start: args.start,
        end: args.end,
    })
}

pub async fn handle(args: HistoryArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let range = range(&args)?;
    let bridge = util::open_offline(global).await?;
    let device = bridge.resolve_device(&args.device)?;
    let records = bridge.history(device.id, range, args.limit, args.offset).await?;
    util::close(&bridge).await;

    tracing::debug!(device_id = %device.id, records = records.len(), "history loaded");
    let out = output::render_list(global.output, &records, |r| HistoryRow::from(r), plain_line)?;
    output::print_output(&out, global.quiet);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::DateTime;
    use tado_local_core::{DeviceId, FieldValue};

    fn record() -> HistoryRecord {
        HistoryRecord {
            device_id: DeviceId(1),
            bucket: 1_704_067_200,
            fields: BTreeMap::from([
                (TrackedField::CurrentTemperature, FieldValue::Float(20.5)),
                (TrackedField::TargetHeatingCoolingState, FieldValue::Int(1)),
            ]),
            updated_at: DateTime::from_timestamp(1_704_067_205, 0).unwrap(),
        }
    }

    #[test]
    fn rows_show_units_and_modes() {
        let row = HistoryRow::from(&record());
        assert_eq!(row.bucket, "2024-01-01 00:00:00");
        assert_eq!(row.current, "20.5°C");
        assert_eq!(row.mode, "heat");
        assert_eq!(row.humidity, "-");
    }

    #[test]
    fn plain_lines_list_stored_fields() {
        assert_eq!(
            plain_line(&record()),
            "1704067200\tcurrent_temperature=20.5 target_heating_cooling_state=1"
        );
    }

    #[test]
    fn inverted_range_is_rejected() {
        let args = HistoryArgs {
            device: "Kitchen".into(),
            start: DateTime::from_timestamp(200, 0),
            end: DateTime::from_timestamp(100, 0),
            limit: 10,
            offset: 0,
        };
        assert!(range(&args).is_err());
    }
}
