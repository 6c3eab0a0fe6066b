// ── Device state store ──
//
// Current state lives in memory, history in SQLite. Every accepted value
// goes through `update_field`, which serializes per device so the bucket
// ledger and the stored record never disagree.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_core::Stream;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::collection::EntityCollection;
use super::ledger::{BucketLedger, HistoryWrite, bucket_of};
use crate::db::Database;
use crate::error::CoreError;
use crate::model::{
    Device, DeviceId, DeviceRegistration, DeviceSnapshot, FieldState, FieldValue, HistoryRange,
    HistoryRecord, TrackedField, UpdateSource, Zone, ZoneId,
};
use crate::stream::EntityStream;

/// Boxed stream of history records.
pub type HistoryStream = Pin<Box<dyn Stream<Item = Result<HistoryRecord, CoreError>> + Send>>;

/// Result of applying one accepted value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldUpdate {
    pub previous: Option<FieldValue>,
    pub history: HistoryWrite,
}

#[derive(Debug, Clone, Copy)]
struct Prediction {
    value: FieldValue,
    expires_at: DateTime<Utc>,
}

/// Registry, current state and history of every device.
pub struct StateStore {
    db: Database,
    bucket_secs: i64,
    prediction_ttl: chrono::Duration,
    devices: EntityCollection<DeviceId, Device>,
    zones: EntityCollection<ZoneId, Zone>,
    current: DashMap<DeviceId, DeviceSnapshot>,
    ledgers: DashMap<DeviceId, Arc<Mutex<BucketLedger>>>,
    predictions: DashMap<DeviceId, HashMap<TrackedField, Prediction>>,
}

impl StateStore {
    pub fn new(db: Database, bucket_secs: i64, prediction_ttl: std::time::Duration) -> Self {
        Self {
            db,
            bucket_secs: bucket_secs.max(1),
            prediction_ttl: chrono::Duration::from_std(prediction_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
            devices: EntityCollection::new(),
            zones: EntityCollection::new(),
            current: DashMap::new(),
            ledgers: DashMap::new(),
            predictions: DashMap::new(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn bucket_secs(&self) -> i64 {
        self.bucket_secs
    }

    // ── Startup ──────────────────────────────────────────────────────

    /// Load the registry and rebuild current state from each device's
    /// newest history bucket. Returns the records used, so the reconciler
    /// can seed its last-value cache from the same data.
    pub async fn load(&self) -> Result<Vec<HistoryRecord>, CoreError> {
        self.refresh_registry().await?;

        let latest = self.db.latest_history().await?;
        for record in &latest {
            let mut snapshot = DeviceSnapshot::new(record.device_id);
            for (field, value) in &record.fields {
                // Reloaded values carry no source of their own.
                snapshot.fields.insert(
                    *field,
                    FieldState {
                        value: *value,
                        updated_at: record.updated_at,
                        source: UpdateSource::SlowPoll,
                        optimistic: false,
                    },
                );
            }
            self.current.insert(record.device_id, snapshot);
            self.ledgers.insert(
                record.device_id,
                Arc::new(Mutex::new(BucketLedger::from_record(record.bucket, record.fields.clone()))),
            );
        }
        info!(
            devices = self.devices.len(),
            with_state = latest.len(),
            "state restored from history"
        );
        Ok(latest)
    }

    /// Re-read devices and zones from the database into the in-memory
    /// registry.
    pub async fn refresh_registry(&self) -> Result<(), CoreError> {
        for device in self.db.list_devices().await? {
            self.devices.upsert(device.serial_number.clone(), device.id, device);
        }
        for zone in self.db.list_zones().await? {
            self.zones.upsert(zone_key(zone.id), zone.id, zone);
        }
        Ok(())
    }

    // ── Registry ─────────────────────────────────────────────────────

    /// Register a device by serial number (see [`Database::register_device`]).
    pub async fn upsert_device(&self, reg: &DeviceRegistration) -> Result<Arc<Device>, CoreError> {
        let (device, created) = self.db.register_device(reg).await?;
        if created {
            info!(
                device_id = %device.id,
                serial = %device.serial_number,
                kind = %device.kind,
                "new device registered"
            );
        }
        let id = device.id;
        self.devices.upsert(device.serial_number.clone(), id, device);
        self.devices.get_by_id(&id).ok_or_else(|| CoreError::DeviceNotFound {
            identifier: id.to_string(),
        })
    }

    /// Reload one device row after an out-of-band update.
    pub async fn reload_device(&self, id: DeviceId) -> Result<(), CoreError> {
        if let Some(device) = self.db.device(id).await? {
            self.devices.upsert(device.serial_number.clone(), id, device);
        }
        Ok(())
    }

    pub(crate) fn put_zone(&self, zone: Zone) {
        self.zones.upsert(zone_key(zone.id), zone.id, zone);
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.get_by_id(&id)
    }

    pub fn device_by_serial(&self, serial: &str) -> Option<Arc<Device>> {
        self.devices.get_by_key(serial)
    }

    /// Find a device by id, serial number or (case-insensitive) name.
    pub fn resolve_device(&self, identifier: &str) -> Option<Arc<Device>> {
        if let Ok(id) = identifier.parse::<DeviceId>() {
            if let Some(device) = self.device(id) {
                return Some(device);
            }
        }
        if let Some(device) = self.device_by_serial(identifier.trim()) {
            return Some(device);
        }
        self.devices
            .snapshot()
            .iter()
            .find(|d| d.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(identifier.trim())))
            .cloned()
    }

    pub fn zone(&self, id: ZoneId) -> Option<Arc<Zone>> {
        self.zones.get_by_id(&id)
    }

    /// Devices ordered by id.
    pub fn devices_snapshot(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.devices.snapshot().iter().cloned().collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    /// Zones in display order.
    pub fn zones_snapshot(&self) -> Vec<Arc<Zone>> {
        let mut zones: Vec<_> = self.zones.snapshot().iter().cloned().collect();
        zones.sort_by_key(|z| (z.order, z.id));
        zones
    }

    pub fn subscribe_devices(&self) -> EntityStream<Device> {
        EntityStream::new(self.devices.subscribe())
    }

    pub fn subscribe_zones(&self) -> EntityStream<Zone> {
        EntityStream::new(self.zones.subscribe())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// `zone (device)` label for log lines.
    pub fn label(&self, id: DeviceId) -> String {
        let Some(device) = self.device(id) else {
            return format!("- (device {id})");
        };
        let zone = device
            .zone_id
            .and_then(|z| self.zone(z))
            .map_or_else(|| "-".to_owned(), |z| z.name.clone());
        format!("{zone} ({})", device.display_name())
    }

    // ── Current state ────────────────────────────────────────────────

    /// Apply an accepted value: update current state and write history
    /// when the bucket rules call for it.
    pub async fn update_field(
        &self,
        device_id: DeviceId,
        field: TrackedField,
        value: FieldValue,
        at: DateTime<Utc>,
        source: UpdateSource,
    ) -> Result<FieldUpdate, CoreError> {
        if !self.devices.contains_id(&device_id) {
            return Err(CoreError::DeviceNotFound {
                identifier: device_id.to_string(),
            });
        }

        let ledger = self.ledger(device_id);
        let mut ledger = ledger.lock().await;

        // History is persisted before current state moves, so a failed
        // write leaves the device exactly as it was.
        let mut snapshot: BTreeMap<TrackedField, FieldValue> = self
            .current
            .get(&device_id)
            .map(|entry| entry.fields.iter().map(|(f, s)| (*f, s.value)).collect())
            .unwrap_or_default();
        snapshot.insert(field, value);

        let bucket = bucket_of(at, self.bucket_secs);
        let write = ledger.plan(bucket, field, value);
        match write {
            HistoryWrite::NewBucket => self.db.write_history(device_id, bucket, &snapshot).await?,
            HistoryWrite::Merged | HistoryWrite::Late => {
                if write == HistoryWrite::Late {
                    debug!(%device_id, %field, bucket, "late value merged into an older bucket");
                }
                self.db
                    .write_history(device_id, bucket, &BTreeMap::from([(field, value)]))
                    .await?;
            }
            HistoryWrite::Skipped => trace!(%device_id, %field, bucket, "bucket already holds value"),
        }
        ledger.commit(bucket, write, field, value, &snapshot);

        let previous = self
            .current
            .entry(device_id)
            .or_insert_with(|| DeviceSnapshot::new(device_id))
            .fields
            .insert(
                field,
                FieldState {
                    value,
                    updated_at: at,
                    source,
                    optimistic: false,
                },
            )
            .map(|s| s.value);
        self.settle_prediction(device_id, field, value);

        Ok(FieldUpdate {
            previous,
            history: write,
        })
    }

    /// Current state of a device. `None` when the device is unknown;
    /// known devices with no observations yet get an empty snapshot.
    pub fn current_state(&self, device_id: DeviceId) -> Option<DeviceSnapshot> {
        if let Some(snapshot) = self.current.get(&device_id) {
            return Some(snapshot.clone());
        }
        self.devices
            .contains_id(&device_id)
            .then(|| DeviceSnapshot::new(device_id))
    }

    /// Every device's current state.
    pub fn all_current(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<_> = self.current.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.device_id);
        all
    }

    // ── Predictions ──────────────────────────────────────────────────

    /// Remember a value just written to the gateway until the device
    /// confirms it or the prediction expires.
    pub fn record_prediction(&self, device_id: DeviceId, field: TrackedField, value: FieldValue) {
        let expires_at = Utc::now() + self.prediction_ttl;
        self.predictions
            .entry(device_id)
            .or_default()
            .insert(field, Prediction { value, expires_at });
    }

    /// Current state with unexpired predictions overlaid.
    pub fn predicted_state(&self, device_id: DeviceId) -> Option<DeviceSnapshot> {
        let mut snapshot = self.current_state(device_id)?;
        let now = Utc::now();

        let mut drop_entry = false;
        if let Some(mut predictions) = self.predictions.get_mut(&device_id) {
            predictions.retain(|_, p| p.expires_at > now);
            for (field, prediction) in predictions.iter() {
                let source = snapshot
                    .get(*field)
                    .map_or(UpdateSource::Push, |s| s.source);
                snapshot.fields.insert(
                    *field,
                    FieldState {
                        value: prediction.value,
                        updated_at: now,
                        source,
                        optimistic: true,
                    },
                );
            }
            drop_entry = predictions.is_empty();
        }
        if drop_entry {
            self.predictions.remove(&device_id);
        }
        Some(snapshot)
    }

    /// Real data for a device supersedes its predictions.
    fn settle_prediction(&self, device_id: DeviceId, field: TrackedField, value: FieldValue) {
        let Some((_, predictions)) = self.predictions.remove(&device_id) else {
            return;
        };
        if let Some(prediction) = predictions.get(&field) {
            if prediction.value != value && prediction.expires_at > Utc::now() {
                info!(
                    %device_id,
                    %field,
                    predicted = %prediction.value,
                    actual = %value,
                    "device reported a different value than written"
                );
            }
        }
    }

    // ── History ──────────────────────────────────────────────────────

    /// One page of history, newest first.
    pub async fn history(
        &self,
        device_id: DeviceId,
        range: HistoryRange,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        self.require_device(device_id)?;
        let (start, end) = self.bucket_range(range);
        self.db.query_history(device_id, start, end, limit, offset).await
    }

    /// All history in `range`, newest first, fetched lazily in pages.
    pub fn history_stream(
        &self,
        device_id: DeviceId,
        range: HistoryRange,
        page_size: u32,
    ) -> Result<HistoryStream, CoreError> {
        self.require_device(device_id)?;
        let (start, end) = self.bucket_range(range);
        let db = self.db.clone();
        let page_size = page_size.max(1);

        let page_len = usize::try_from(page_size).unwrap_or(usize::MAX);

        Ok(Box::pin(async_stream::stream! {
            let mut offset = 0u64;
            loop {
                let page = match db.query_history(device_id, start, end, page_size, offset).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };
                let fetched = page.len();
                for record in page {
                    yield Ok(record);
                }
                if fetched < page_len {
                    break;
                }
                offset += u64::try_from(fetched).unwrap_or(u64::MAX);
            }
        }))
    }

    pub async fn history_count(&self, device_id: DeviceId) -> Result<u64, CoreError> {
        self.db.history_count(device_id).await
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn ledger(&self, device_id: DeviceId) -> Arc<Mutex<BucketLedger>> {
        Arc::clone(self.ledgers.entry(device_id).or_default().value())
    }

    fn require_device(&self, device_id: DeviceId) -> Result<(), CoreError> {
        if self.devices.contains_id(&device_id) {
            Ok(())
        } else {
            Err(CoreError::DeviceNotFound {
                identifier: device_id.to_string(),
            })
        }
    }

    fn bucket_range(&self, range: HistoryRange) -> (Option<i64>, Option<i64>) {
        (
            range.start.map(|t| bucket_of(t, self.bucket_secs)),
            range.end.map(|t| bucket_of(t, self.bucket_secs)),
        )
    }
}

fn zone_key(id: ZoneId) -> String {
    format!("zone:{id}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;

    const TEMP: TrackedField = TrackedField::CurrentTemperature;
    const HUMIDITY: TrackedField = TrackedField::Humidity;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    async fn store_with_device() -> (StateStore, DeviceId) {
        let db = Database::in_memory().await.unwrap();
        let store = StateStore::new(db, 10, Duration::from_secs(10));
        let device = store
            .upsert_device(&DeviceRegistration {
                serial_number: "RU001".into(),
                name: Some("Kitchen".into()),
                ..DeviceRegistration::default()
            })
            .await
            .unwrap();
        (store, device.id)
    }

    #[tokio::test]
    async fn unknown_device_has_no_state() {
        let (store, id) = store_with_device().await;
        assert!(store.current_state(DeviceId(999)).is_none());
        assert!(store.current_state(id).unwrap().fields.is_empty());
        let err = store
            .update_field(DeviceId(999), TEMP, FieldValue::Float(1.0), at(100), UpdateSource::Push)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_history_write_leaves_current_state_untouched() {
        let (store, id) = store_with_device().await;
        store.db().close().await;

        let result = store
            .update_field(id, TEMP, FieldValue::Float(20.5), at(100), UpdateSource::Push)
            .await;
        assert!(result.is_err());
        assert!(store.current_state(id).unwrap().fields.get(&TEMP).is_none());
    }

    #[tokio::test]
    async fn two_fields_in_one_bucket_are_merged() {
        let (store, id) = store_with_device().await;
        store
            .update_field(id, TEMP, FieldValue::Float(20.5), at(100), UpdateSource::Push)
            .await
            .unwrap();
        let update = store
            .update_field(id, HUMIDITY, FieldValue::Float(48.0), at(105), UpdateSource::FastPoll)
            .await
            .unwrap();
        assert_eq!(update.history, HistoryWrite::Merged);

        let records = store.history(id, HistoryRange::all(), 10, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value(TEMP), Some(FieldValue::Float(20.5)));
        assert_eq!(records[0].value(HUMIDITY), Some(FieldValue::Float(48.0)));
    }

    #[tokio::test]
    async fn same_field_twice_in_one_bucket_keeps_latest() {
        let (store, id) = store_with_device().await;
        for v in [20.5, 21.0] {
            store
                .update_field(id, TEMP, FieldValue::Float(v), at(101), UpdateSource::Push)
                .await
                .unwrap();
        }
        let records = store.history(id, HistoryRange::all(), 10, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value(TEMP), Some(FieldValue::Float(21.0)));
    }

    #[tokio::test]
    async fn unchanged_value_in_same_bucket_skips_the_write() {
        let (store, id) = store_with_device().await;
        store
            .update_field(id, TEMP, FieldValue::Float(20.5), at(100), UpdateSource::Push)
            .await
            .unwrap();
        let update = store
            .update_field(id, TEMP, FieldValue::Float(20.5), at(104), UpdateSource::SlowPoll)
            .await
            .unwrap();
        assert_eq!(update.history, HistoryWrite::Skipped);
        assert_eq!(update.previous, Some(FieldValue::Float(20.5)));
    }

    #[tokio::test]
    async fn new_bucket_carries_full_current_state() {
        let (store, id) = store_with_device().await;
        store
            .update_field(id, TEMP, FieldValue::Float(20.5), at(100), UpdateSource::Push)
            .await
            .unwrap();
        store
            .update_field(id, HUMIDITY, FieldValue::Float(40.0), at(100), UpdateSource::Push)
            .await
            .unwrap();
        let update = store
            .update_field(id, TEMP, FieldValue::Float(21.0), at(220), UpdateSource::SlowPoll)
            .await
            .unwrap();
        assert_eq!(update.history, HistoryWrite::NewBucket);
        assert_eq!(update.previous, Some(FieldValue::Float(20.5)));

        let records = store.history(id, HistoryRange::all(), 10, 0).await.unwrap();
        assert_eq!(records.iter().map(|r| r.bucket).collect::<Vec<_>>(), vec![220, 100]);
        assert_eq!(records[0].value(HUMIDITY), Some(FieldValue::Float(40.0)));

        let state = store.current_state(id).unwrap();
        assert_eq!(state.get(TEMP).unwrap().source, UpdateSource::SlowPoll);
    }

    #[tokio::test]
    async fn late_value_does_not_move_the_ledger() {
        let (store, id) = store_with_device().await;
        store
            .update_field(id, TEMP, FieldValue::Float(20.0), at(200), UpdateSource::Push)
            .await
            .unwrap();
        let update = store
            .update_field(id, HUMIDITY, FieldValue::Float(50.0), at(150), UpdateSource::Cloud)
            .await
            .unwrap();
        assert_eq!(update.history, HistoryWrite::Late);

        // The newer bucket still dedups against what it holds.
        let update = store
            .update_field(id, TEMP, FieldValue::Float(20.0), at(205), UpdateSource::Push)
            .await
            .unwrap();
        assert_eq!(update.history, HistoryWrite::Skipped);
        assert_eq!(store.history_count(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reload_restores_state_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let id = {
            let db = Database::open(&path).await.unwrap();
            let store = StateStore::new(db.clone(), 10, Duration::from_secs(10));
            let device = store
                .upsert_device(&DeviceRegistration {
                    serial_number: "RU001".into(),
                    ..DeviceRegistration::default()
                })
                .await
                .unwrap();
            store
                .update_field(device.id, TEMP, FieldValue::Float(20.5), at(100), UpdateSource::Push)
                .await
                .unwrap();
            db.close().await;
            device.id
        };

        let store = StateStore::new(Database::open(&path).await.unwrap(), 10, Duration::from_secs(10));
        let latest = store.load().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(store.current_state(id).unwrap().value(TEMP), Some(FieldValue::Float(20.5)));
        assert!(store.device_by_serial("RU001").is_some());

        let update = store
            .update_field(id, TEMP, FieldValue::Float(20.5), at(103), UpdateSource::SlowPoll)
            .await
            .unwrap();
        assert_eq!(update.history, HistoryWrite::Skipped);
    }

    #[tokio::test]
    async fn predictions_overlay_until_real_data_arrives() {
        let (store, id) = store_with_device().await;
        let target = TrackedField::TargetTemperature;
        store
            .update_field(id, target, FieldValue::Float(20.0), at(100), UpdateSource::Push)
            .await
            .unwrap();

        store.record_prediction(id, target, FieldValue::Float(22.0));
        let predicted = store.predicted_state(id).unwrap();
        assert!(predicted.get(target).unwrap().optimistic);
        assert_eq!(predicted.value(target), Some(FieldValue::Float(22.0)));
        assert_eq!(store.current_state(id).unwrap().value(target), Some(FieldValue::Float(20.0)));

        store
            .update_field(id, target, FieldValue::Float(22.0), at(110), UpdateSource::Push)
            .await
            .unwrap();
        let predicted = store.predicted_state(id).unwrap();
        assert!(!predicted.get(target).unwrap().optimistic);
    }

    #[tokio::test]
    async fn expired_predictions_are_dropped() {
        let db = Database::in_memory().await.unwrap();
        let store = StateStore::new(db, 10, Duration::ZERO);
        let device = store
            .upsert_device(&DeviceRegistration {
                serial_number: "RU001".into(),
                ..DeviceRegistration::default()
            })
            .await
            .unwrap();
        store.record_prediction(device.id, TrackedField::TargetTemperature, FieldValue::Float(22.0));
        let predicted = store.predicted_state(device.id).unwrap();
        assert!(predicted.get(TrackedField::TargetTemperature).is_none());
    }

    #[tokio::test]
    async fn history_stream_pages_through_everything() {
        let (store, id) = store_with_device().await;
        for (secs, v) in [(100, 20.0), (110, 20.5), (120, 21.0), (130, 21.5), (140, 22.0)] {
            store
                .update_field(id, TEMP, FieldValue::Float(v), at(secs), UpdateSource::Push)
                .await
                .unwrap();
        }

        let buckets: Vec<i64> = store
            .history_stream(id, HistoryRange::between(at(110), at(139)), 2)
            .unwrap()
            .map(|r| r.unwrap().bucket)
            .collect()
            .await;
        assert_eq!(buckets, vec![130, 120, 110]);
    }

    #[tokio::test]
    async fn resolve_device_by_id_serial_or_name() {
        let (store, id) = store_with_device().await;
        assert_eq!(store.resolve_device(&id.to_string()).unwrap().id, id);
        assert_eq!(store.resolve_device("RU001").unwrap().id, id);
        assert_eq!(store.resolve_device("kitchen").unwrap().id, id);
        assert!(store.resolve_device("garage").is_none());
        assert_eq!(store.label(id), "- (Kitchen)");
    }
}
