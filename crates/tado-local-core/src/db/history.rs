// Time-bucketed device history.
//
// Rows are keyed by (device_id, bucket). Writes merge: a column is only
// overwritten by a non-null value, so a later sparse write never erases a
// field recorded earlier in the same bucket.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::Database;
use crate::error::CoreError;
use crate::model::{DeviceId, FieldValue, HistoryRecord, TrackedField, ValueKind};

static UPSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    let columns: Vec<&str> = TrackedField::ALL.iter().map(|f| f.column()).collect();
    let placeholders = vec!["?"; columns.len() + 3].join(", ");
    let mut sql = format!(
        "INSERT INTO device_state_history (device_id, bucket, {}, updated_at) VALUES ({placeholders})\n\
         ON CONFLICT(device_id, bucket) DO UPDATE SET ",
        columns.join(", ")
    );
    for column in &columns {
        let _ = write!(sql, "{column} = COALESCE(excluded.{column}, {column}), ");
    }
    sql.push_str("updated_at = excluded.updated_at");
    sql
});

fn decode_record(row: &SqliteRow) -> Result<HistoryRecord, CoreError> {
    let mut fields = BTreeMap::new();
    for field in TrackedField::ALL {
        let value = match field.kind() {
            ValueKind::Float => row
                .try_get::<Option<f64>, _>(field.column())?
                .map(FieldValue::Float),
            ValueKind::Int => row
                .try_get::<Option<i64>, _>(field.column())?
                .map(FieldValue::Int),
        };
        if let Some(value) = value {
            fields.insert(field, value);
        }
    }
    Ok(HistoryRecord {
        device_id: DeviceId(row.try_get("device_id")?),
        bucket: row.try_get("bucket")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        fields,
    })
}

impl Database {
    /// Merge `fields` into the `(device, bucket)` row, creating it if needed.
    pub async fn write_history(
        &self,
        device: DeviceId,
        bucket: i64,
        fields: &BTreeMap<TrackedField, FieldValue>,
    ) -> Result<(), CoreError> {
        let mut query = sqlx::query(UPSERT_SQL.as_str()).bind(device.get()).bind(bucket);
        for field in TrackedField::ALL {
            let value = fields.get(&field).copied();
            query = match field.kind() {
                ValueKind::Float => query.bind(value.map(FieldValue::as_f64)),
                ValueKind::Int => query.bind(value.map(|v| match v {
                    FieldValue::Int(i) => i,
                    #[allow(clippy::cast_possible_truncation)]
                    FieldValue::Float(f) => f.round() as i64,
                })),
            };
        }
        query.bind(Utc::now()).execute(&self.pool).await?;
        Ok(())
    }

    /// History newest-first, with inclusive bucket bounds.
    pub async fn query_history(
        &self,
        device: DeviceId,
        start_bucket: Option<i64>,
        end_bucket: Option<i64>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        let mut sql = String::from("SELECT * FROM device_state_history WHERE device_id = ?");
        if start_bucket.is_some() {
            sql.push_str(" AND bucket >= ?");
        }
        if end_bucket.is_some() {
            sql.push_str(" AND bucket <= ?");
        }
        sql.push_str(" ORDER BY bucket DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql).bind(device.get());
        if let Some(start) = start_bucket {
            query = query.bind(start);
        }
        if let Some(end) = end_bucket {
            query = query.bind(end);
        }
        let rows = query
            .bind(i64::from(limit))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_record).collect()
    }

    /// The newest bucket of every device that has history.
    pub async fn latest_history(&self) -> Result<Vec<HistoryRecord>, CoreError> {
        let rows = sqlx::query(
            "SELECT h.* FROM device_state_history h
             JOIN (SELECT device_id, MAX(bucket) AS bucket
                   FROM device_state_history GROUP BY device_id) latest
               ON h.device_id = latest.device_id AND h.bucket = latest.bucket
             ORDER BY h.device_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_record).collect()
    }

    pub async fn history_count(&self, device: DeviceId) -> Result<u64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM device_state_history WHERE device_id = ?")
            .bind(device.get())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
