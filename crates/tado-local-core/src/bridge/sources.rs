// ── Observation sources ──
//
// Everything that turns gateway traffic into `Observation`s: the push
// listener, the two poll loops and the one-off baseline read. None of them
// touch state directly; they only feed the reconciler channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tado_local_api::hap::{Accessory, AccessorySession, CharacteristicId, PushEvent};

use super::BridgeStats;
use super::mapping::FieldMap;
use crate::db::Database;
use crate::error::CoreError;
use crate::model::{DeviceId, DeviceRegistration, FieldValue, Observation, UpdateSource};
use crate::store::StateStore;

// ── Accessory tree ───────────────────────────────────────────────────

/// Fetch the accessory tree, reusing the cached copy while the gateway's
/// configuration version is unchanged.
pub(crate) async fn load_accessories(
    db: &Database,
    session: &dyn AccessorySession,
    identity_key: &str,
) -> Result<Vec<Accessory>, CoreError> {
    let discovery = session.discovery().await?;
    match db.load_accessory_cache(identity_key).await {
        Ok(Some(cached))
            if cached.discovery.config_version.is_some()
                && cached.discovery.config_version == discovery.config_version =>
        {
            debug!(
                config_version = ?discovery.config_version,
                accessories = cached.accessories.len(),
                "using cached accessory tree"
            );
            return Ok(cached.accessories);
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "accessory cache unreadable; enumerating"),
    }

    let accessories = session.accessories().await?;
    info!(
        config_version = ?discovery.config_version,
        accessories = accessories.len(),
        "enumerated accessory tree"
    );
    if let Err(e) = db.save_accessory_cache(identity_key, &discovery, &accessories).await {
        warn!(error = %e, "failed to cache accessory tree");
    }
    Ok(accessories)
}

/// Register every accessory that carries a serial number. Returns the
/// session's `aid` → device mapping.
pub(crate) async fn register_accessories(
    store: &StateStore,
    accessories: &[Accessory],
) -> Result<HashMap<u64, DeviceId>, CoreError> {
    let mut by_aid = HashMap::new();
    for accessory in accessories {
        let Some(reg) = DeviceRegistration::from_accessory(accessory) else {
            debug!(aid = accessory.aid, "accessory without serial number skipped");
            continue;
        };
        let device = store.upsert_device(&reg).await?;
        by_aid.insert(accessory.aid, device.id);
    }
    Ok(by_aid)
}

// ── Reads ────────────────────────────────────────────────────────────

/// Read `ids` in batches and forward every result. Returns the number of
/// observations sent.
pub(crate) async fn read_into(
    session: &dyn AccessorySession,
    map: &FieldMap,
    ids: &[CharacteristicId],
    batch_size: usize,
    source: UpdateSource,
    tx: &mpsc::Sender<Observation>,
) -> Result<usize, CoreError> {
    let mut sent = 0;
    for chunk in ids.chunks(batch_size.max(1)) {
        let readings = session.read(chunk).await?;
        let observed_at = Utc::now();
        for reading in readings {
            let Some(tracked) = map.lookup(reading.id()) else {
                continue;
            };
            let obs = Observation {
                device_id: tracked.device_id,
                field: tracked.field,
                value: reading
                    .value
                    .as_ref()
                    .and_then(|v| FieldValue::from_json(tracked.field, v)),
                source,
                observed_at,
            };
            if tx.send(obs).await.is_err() {
                return Err(CoreError::Disconnected);
            }
            sent += 1;
        }
    }
    Ok(sent)
}

// ── Push listener ────────────────────────────────────────────────────

/// Forward push events until the session's event stream ends or `cancel`
/// fires.
pub(crate) async fn push_listener(
    mut events: mpsc::Receiver<PushEvent>,
    map: Arc<FieldMap>,
    tx: mpsc::Sender<Observation>,
    stats: Arc<BridgeStats>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("push event stream ended");
                    break;
                };
                stats.events_received.fetch_add(1, Ordering::Relaxed);
                let Some(tracked) = map.lookup(event.id()) else {
                    continue;
                };
                let obs = Observation {
                    device_id: tracked.device_id,
                    field: tracked.field,
                    value: event.value.as_ref().and_then(|v| FieldValue::from_json(tracked.field, v)),
                    source: UpdateSource::Push,
                    observed_at: Utc::now(),
                };
                if tx.send(obs).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ── Poll loops ───────────────────────────────────────────────────────

/// One periodic re-read of a fixed characteristic set.
pub(crate) struct PollTask {
    pub session: Arc<dyn AccessorySession>,
    pub map: Arc<FieldMap>,
    pub ids: Vec<CharacteristicId>,
    pub every: Duration,
    pub batch_size: usize,
    pub source: UpdateSource,
    pub tx: mpsc::Sender<Observation>,
}

impl PollTask {
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match read_into(
                        self.session.as_ref(),
                        &self.map,
                        &self.ids,
                        self.batch_size,
                        self.source,
                        &self.tx,
                    )
                    .await
                    {
                        Ok(n) => debug!(source = %self.source, observations = n, "poll complete"),
                        Err(e) => warn!(source = %self.source, error = %e, "poll failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::TrackedField;
    use tado_local_api::hap::GatewayTransport;
    use tado_local_api::hap::PairingCredential;
    use tado_local_api::hap::mock::{MockGateway, iids, thermostat_accessory};

    async fn session(gw: &MockGateway) -> Arc<dyn AccessorySession> {
        let credential = PairingCredential {
            gateway_address: "10.0.0.2".into(),
            data: json!({ "AccessoryPairingID": "MOCK-GATEWAY" }),
        };
        gw.connect(&credential).await.unwrap()
    }

    fn single_map() -> FieldMap {
        FieldMap::build(
            &[thermostat_accessory(2, "RU001", "Kitchen")],
            &HashMap::from([(2, DeviceId(1))]),
        )
    }

    #[tokio::test]
    async fn reads_are_batched() {
        let gw = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
        let session = session(&gw).await;
        let map = single_map();
        let (tx, mut rx) = mpsc::channel(32);

        let sent = read_into(session.as_ref(), &map, &map.readable(), 4, UpdateSource::SlowPoll, &tx)
            .await
            .unwrap();
        assert_eq!(sent, 6);
        let batches: Vec<usize> = gw.reads().iter().map(Vec::len).collect();
        assert_eq!(batches, vec![4, 2]);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.field, TrackedField::CurrentTemperature);
        assert_eq!(first.value, Some(FieldValue::Float(19.0)));
        assert_eq!(first.source, UpdateSource::SlowPoll);
    }

    #[tokio::test]
    async fn null_reads_become_empty_observations() {
        let gw = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
        let id = CharacteristicId::new(2, iids::HUMIDITY);
        gw.set_null_read(id);
        let session = session(&gw).await;
        let map = single_map();
        let (tx, mut rx) = mpsc::channel(4);

        read_into(session.as_ref(), &map, &[id], 15, UpdateSource::FastPoll, &tx).await.unwrap();
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.field, TrackedField::Humidity);
        assert_eq!(obs.value, None);
    }

    #[tokio::test]
    async fn accessory_tree_is_cached_by_config_version() {
        let gw = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
        let session = session(&gw).await;
        let db = Database::in_memory().await.unwrap();

        load_accessories(&db, session.as_ref(), "gw").await.unwrap();
        load_accessories(&db, session.as_ref(), "gw").await.unwrap();
        assert_eq!(gw.enumerate_calls(), 1);

        gw.set_config_version(2);
        let tree = load_accessories(&db, session.as_ref(), "gw").await.unwrap();
        assert_eq!(gw.enumerate_calls(), 2);
        assert_eq!(tree.len(), 1);
    }

    #[tokio::test]
    async fn push_listener_counts_every_event() {
        let gw = MockGateway::new(vec![thermostat_accessory(2, "RU001", "Kitchen")]);
        let session = session(&gw).await;
        let map = Arc::new(single_map());
        let events = session.subscribe(&map.subscribable()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let stats = Arc::new(BridgeStats::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(push_listener(
            events,
            Arc::clone(&map),
            tx,
            Arc::clone(&stats),
            cancel.clone(),
        ));

        gw.push(CharacteristicId::new(2, iids::TARGET_TEMPERATURE), json!(21.5));
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.field, TrackedField::TargetTemperature);
        assert_eq!(obs.value, Some(FieldValue::Float(21.5)));
        assert_eq!(obs.source, UpdateSource::Push);

        gw.push_null(CharacteristicId::new(2, iids::CURRENT_TEMPERATURE));
        assert_eq!(rx.recv().await.unwrap().value, None);
        assert_eq!(stats.events_received.load(Ordering::Relaxed), 2);

        // Losing the connection ends the listener.
        gw.drop_connection();
        task.await.unwrap();
    }
}
