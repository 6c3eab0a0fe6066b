// Reconciler and history behavior with explicit timestamps.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use tado_local_core::db::Database;
use tado_local_core::{
    DeviceId, DeviceRegistration, FieldValue, HistoryRange, Observation, Reconciler, StateChange, StateStore,
    TrackedField, UpdateSource,
};

// ── Helpers ─────────────────────────────────────────────────────────

struct Harness {
    store: Arc<StateStore>,
    reconciler: Reconciler,
    changes: broadcast::Receiver<StateChange>,
    kitchen: DeviceId,
}

async fn harness(bucket_secs: i64) -> Harness {
    let db = Database::in_memory().await.unwrap();
    let store = Arc::new(StateStore::new(db, bucket_secs, Duration::from_secs(10)));
    let kitchen = store
        .upsert_device(&DeviceRegistration {
            serial_number: "RU001".into(),
            name: Some("Kitchen".into()),
            ..Default::default()
        })
        .await
        .unwrap()
        .id;
    let (tx, changes) = broadcast::channel(64);
    let reconciler = Reconciler::new(Arc::clone(&store), tx);
    Harness {
        store,
        reconciler,
        changes,
        kitchen,
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn obs(device_id: DeviceId, field: TrackedField, value: Option<f64>, source: UpdateSource, t: i64) -> Observation {
    Observation {
        device_id,
        field,
        value: value.map(|v| FieldValue::for_field(field, v)),
        source,
        observed_at: at(t),
    }
}

// ── Scenario ────────────────────────────────────────────────────────

#[tokio::test]
async fn kitchen_push_then_polls() {
    let mut h = harness(60).await;
    let temp = TrackedField::CurrentTemperature;

    // t=100: push sets 20.5.
    let change = h
        .reconciler
        .apply(obs(h.kitchen, temp, Some(20.5), UpdateSource::Push, 100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.previous_value, None);
    let state = h.store.current_state(h.kitchen).unwrap();
    let current = state.get(temp).unwrap();
    assert_eq!(current.value, FieldValue::Float(20.5));
    assert_eq!(current.source, UpdateSource::Push);
    assert_eq!(current.updated_at, at(100));

    // t=160: fast poll reads the same value.
    let repeat = h
        .reconciler
        .apply(obs(h.kitchen, temp, Some(20.5), UpdateSource::FastPoll, 160))
        .await
        .unwrap();
    assert_eq!(repeat, None);
    assert_eq!(h.store.history_count(h.kitchen).await.unwrap(), 1);

    // t=220: slow poll reads a new value.
    let change = h
        .reconciler
        .apply(obs(h.kitchen, temp, Some(21.0), UpdateSource::SlowPoll, 220))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.value, FieldValue::Float(21.0));
    assert_eq!(change.previous_value, Some(FieldValue::Float(20.5)));
    assert_eq!(change.source, UpdateSource::SlowPoll);
    assert_eq!(change.timestamp, at(220));

    let history = h.store.history(h.kitchen, HistoryRange::all(), 10, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].bucket, 180);
    assert_eq!(history[0].value(temp), Some(FieldValue::Float(21.0)));
    assert_eq!(history[1].bucket, 60);
    assert_eq!(history[1].value(temp), Some(FieldValue::Float(20.5)));

    // Subscribers saw exactly the two accepted values.
    assert_eq!(h.changes.try_recv().unwrap().value, FieldValue::Float(20.5));
    assert_eq!(h.changes.try_recv().unwrap().value, FieldValue::Float(21.0));
    assert!(h.changes.try_recv().is_err());
}

// ── Properties ──────────────────────────────────────────────────────

#[tokio::test]
async fn consecutive_equal_values_forward_once() {
    let mut h = harness(10).await;
    let target = TrackedField::TargetTemperature;
    let sources = [UpdateSource::Push, UpdateSource::SlowPoll, UpdateSource::FastPoll, UpdateSource::Push];

    let mut forwarded = 0;
    for (t, source) in (0_i64..).step_by(30).zip(sources) {
        if h.reconciler
            .apply(obs(h.kitchen, target, Some(21.0), source, t))
            .await
            .unwrap()
            .is_some()
        {
            forwarded += 1;
        }
    }

    assert_eq!(forwarded, 1);
    let counters = *h.reconciler.counters().borrow();
    assert_eq!(counters.push, 1);
    assert_eq!(counters.discarded_duplicate, 3);
}

#[tokio::test]
async fn null_values_never_reach_state_or_history() {
    let mut h = harness(10).await;
    let humidity = TrackedField::Humidity;

    h.reconciler
        .apply(obs(h.kitchen, humidity, Some(45.0), UpdateSource::SlowPoll, 5))
        .await
        .unwrap();
    let outcome = h
        .reconciler
        .apply(obs(h.kitchen, humidity, None, UpdateSource::FastPoll, 25))
        .await
        .unwrap();

    assert_eq!(outcome, None);
    assert_eq!(
        h.store.current_state(h.kitchen).unwrap().value(humidity),
        Some(FieldValue::Float(45.0))
    );
    assert_eq!(h.store.history_count(h.kitchen).await.unwrap(), 1);
    assert_eq!(h.reconciler.counters().borrow().discarded_null, 1);
}

#[tokio::test]
async fn different_fields_in_one_bucket_merge() {
    let mut h = harness(60).await;

    h.reconciler
        .apply(obs(h.kitchen, TrackedField::CurrentTemperature, Some(19.5), UpdateSource::Push, 61))
        .await
        .unwrap();
    h.reconciler
        .apply(obs(h.kitchen, TrackedField::Humidity, Some(48.0), UpdateSource::FastPoll, 90))
        .await
        .unwrap();

    let history = h.store.history(h.kitchen, HistoryRange::all(), 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].bucket, 60);
    assert_eq!(history[0].value(TrackedField::CurrentTemperature), Some(FieldValue::Float(19.5)));
    assert_eq!(history[0].value(TrackedField::Humidity), Some(FieldValue::Float(48.0)));
}

#[tokio::test]
async fn same_field_twice_in_one_bucket_keeps_latest() {
    let mut h = harness(60).await;
    let target = TrackedField::TargetTemperature;

    for (t, value) in [(120, 20.0), (130, 21.0), (170, 22.5)] {
        h.reconciler
            .apply(obs(h.kitchen, target, Some(value), UpdateSource::Push, t))
            .await
            .unwrap();
    }

    let history = h.store.history(h.kitchen, HistoryRange::all(), 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].value(target), Some(FieldValue::Float(22.5)));
}

#[tokio::test]
async fn new_bucket_carries_the_full_snapshot() {
    let mut h = harness(60).await;

    h.reconciler
        .apply(obs(h.kitchen, TrackedField::Humidity, Some(45.0), UpdateSource::SlowPoll, 10))
        .await
        .unwrap();
    h.reconciler
        .apply(obs(h.kitchen, TrackedField::CurrentTemperature, Some(20.0), UpdateSource::Push, 70))
        .await
        .unwrap();

    let history = h.store.history(h.kitchen, HistoryRange::all(), 1, 0).await.unwrap();
    assert_eq!(history[0].bucket, 60);
    assert_eq!(history[0].value(TrackedField::Humidity), Some(FieldValue::Float(45.0)));
    assert_eq!(history[0].value(TrackedField::CurrentTemperature), Some(FieldValue::Float(20.0)));
}

#[tokio::test]
async fn history_pages_and_streams_newest_first() {
    let mut h = harness(10).await;
    let temp = TrackedField::CurrentTemperature;
    for i in 0..5 {
        h.reconciler
            .apply(obs(h.kitchen, temp, Some(18.0 + f64::from(i)), UpdateSource::Push, i64::from(i) * 10))
            .await
            .unwrap();
    }

    let page = h.store.history(h.kitchen, HistoryRange::all(), 2, 1).await.unwrap();
    let buckets: Vec<i64> = page.iter().map(|r| r.bucket).collect();
    assert_eq!(buckets, [30, 20]);

    let ranged = h
        .store
        .history(h.kitchen, HistoryRange::between(at(10), at(30)), 10, 0)
        .await
        .unwrap();
    assert!(ranged.iter().all(|r| (10..=30).contains(&r.bucket)));

    let streamed: Vec<i64> = h
        .store
        .history_stream(h.kitchen, HistoryRange::all(), 2)
        .unwrap()
        .map(|r| r.unwrap().bucket)
        .collect()
        .await;
    assert_eq!(streamed, [40, 30, 20, 10, 0]);
}

#[tokio::test]
async fn history_for_unknown_device_is_not_found() {
    let h = harness(10).await;
    let err = h
        .store
        .history(DeviceId(404), HistoryRange::all(), 10, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, tado_local_core::CoreError::DeviceNotFound { .. }));
}
