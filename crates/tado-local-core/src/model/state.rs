// ── Current-state and history types ──

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::field::{FieldValue, TrackedField};
use super::ids::DeviceId;

/// Where an accepted value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum UpdateSource {
    Push,
    FastPoll,
    SlowPoll,
    Cloud,
}

/// One field of a device's current state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    pub value: FieldValue,
    pub updated_at: DateTime<Utc>,
    pub source: UpdateSource,
    /// Set on values overlaid from a pending write prediction.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optimistic: bool,
}

/// Point-in-time view of one device's fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub fields: BTreeMap<TrackedField, FieldState>,
}

impl DeviceSnapshot {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: TrackedField) -> Option<&FieldState> {
        self.fields.get(&field)
    }

    pub fn value(&self, field: TrackedField) -> Option<FieldValue> {
        self.fields.get(&field).map(|s| s.value)
    }
}

/// A raw value observed by one of the sources, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub device_id: DeviceId,
    pub field: TrackedField,
    /// `None` for null or unreadable values; always discarded.
    pub value: Option<FieldValue>,
    pub source: UpdateSource,
    pub observed_at: DateTime<Utc>,
}

/// An accepted change, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub device_id: DeviceId,
    pub field: TrackedField,
    pub value: FieldValue,
    pub previous_value: Option<FieldValue>,
    pub source: UpdateSource,
    pub timestamp: DateTime<Utc>,
}

/// One stored history bucket. Absent fields were not observed in or
/// before the bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub device_id: DeviceId,
    /// Bucket start, seconds since the Unix epoch.
    pub bucket: i64,
    pub fields: BTreeMap<TrackedField, FieldValue>,
    pub updated_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn bucket_start(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.bucket, 0)
    }

    pub fn value(&self, field: TrackedField) -> Option<FieldValue> {
        self.fields.get(&field).copied()
    }
}

/// Inclusive bucket range for history queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl HistoryRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

/// Per-source accepted-change counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounters {
    pub push: u64,
    pub fast_poll: u64,
    pub slow_poll: u64,
    pub cloud: u64,
    /// Null or unreadable values dropped.
    pub discarded_null: u64,
    /// Values equal to the last accepted one.
    pub discarded_duplicate: u64,
}

impl SourceCounters {
    pub fn record(&mut self, source: UpdateSource) {
        match source {
            UpdateSource::Push => self.push += 1,
            UpdateSource::FastPoll => self.fast_poll += 1,
            UpdateSource::SlowPoll => self.slow_poll += 1,
            UpdateSource::Cloud => self.cloud += 1,
        }
    }
}

/// Bridge health as reported by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub paired: bool,
    pub connected: bool,
    pub gateway_address: Option<String>,
    /// Push events received from the gateway, accepted or not.
    pub events_received: u64,
    /// Changes accepted from either poll loop.
    pub poll_changes: u64,
    pub cloud_syncs: u64,
    pub last_cloud_sync_at: Option<DateTime<Utc>>,
    pub counters: SourceCounters,
    pub reconnects: u64,
    pub device_count: usize,
}
