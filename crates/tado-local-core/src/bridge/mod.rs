// ── Bridge abstraction ──
//
// Full lifecycle management for one tado gateway. Owns the pairing
// manager, the live session and its tasks, the reconciler and the cloud
// sync loop, and exposes state, history and writes to consumers.
//
//   push ───────┐
//   fast poll ──┤
//   slow poll ──┼──▶ observations ──▶ reconciler ──▶ StateStore ──▶ changes
//   cloud ──────┘
//   set_field ──▶ command processor ──▶ gateway

pub mod mapping;
pub mod reconciler;
pub(crate) mod sources;
pub(crate) mod supervisor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tado_local_api::hap::{AccessorySession, CharacteristicId, CharacteristicWrite, GatewayTransport};

use crate::cloud::CloudSync;
use crate::command::{self, Command, CommandEnvelope};
use crate::config::BridgeConfig;
use crate::db::Database;
use crate::error::CoreError;
use crate::model::{
    BridgeStatus, Device, DeviceId, DeviceSnapshot, HistoryRange, HistoryRecord, Observation,
    SourceCounters, StateChange, TrackedField, UpdateSource, Zone,
};
use crate::pairing::{EstablishedSession, PairingManager};
use crate::store::{HistoryStream, StateStore};
use crate::stream::{ChangeStream, EntityStream};

use self::mapping::FieldMap;
use self::reconciler::Reconciler;
use self::sources::PollTask;

const COMMAND_CHANNEL_SIZE: usize = 64;
const CHANGE_CHANNEL_SIZE: usize = 256;
const OBSERVATION_CHANNEL_SIZE: usize = 1024;

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

// ── Counters ─────────────────────────────────────────────────────

/// Counters not owned by the reconciler.
#[derive(Debug, Default)]
pub(crate) struct BridgeStats {
    pub(crate) events_received: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) cloud_syncs: AtomicU64,
    pub(crate) last_cloud_sync_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl BridgeStats {
    pub(crate) fn record_cloud_sync(&self, at: DateTime<Utc>) {
        self.cloud_syncs.fetch_add(1, Ordering::Relaxed);
        *self
            .last_cloud_sync_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    fn last_cloud_sync_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_cloud_sync_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Live session ─────────────────────────────────────────────────

/// One authenticated session and the tasks bound to it.
struct LiveSession {
    session: Arc<dyn AccessorySession>,
    map: Arc<FieldMap>,
    subscribed: Vec<CharacteristicId>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

// ── Bridge ───────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<BridgeInner>`. State and history queries
/// work without a gateway connection; [`start()`](Self::start) connects
/// and spawns the background tasks.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    db: Database,
    store: Arc<StateStore>,
    pairing: PairingManager,
    connection_state: watch::Sender<ConnectionState>,
    change_tx: broadcast::Sender<StateChange>,
    observation_tx: mpsc::Sender<Observation>,
    observation_rx: Mutex<Option<mpsc::Receiver<Observation>>>,
    reconciler: Mutex<Option<Reconciler>>,
    counters: watch::Receiver<SourceCounters>,
    command_tx: mpsc::Sender<CommandEnvelope>,
    command_rx: Mutex<Option<mpsc::Receiver<CommandEnvelope>>>,
    reconnect_tx: mpsc::Sender<u64>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<u64>>>,
    cancel: CancellationToken,
    /// Child of `cancel`; stops reconnects ahead of the session teardown.
    reconnect_cancel: CancellationToken,
    session: Mutex<Option<LiveSession>>,
    /// Bumped on every attached session; tags loss signals.
    generation: AtomicU64,
    /// Gateway address, kept across disconnects for reconnects.
    address: Mutex<Option<String>>,
    stats: Arc<BridgeStats>,
    /// Tasks that live as long as the bridge (reconciler, command
    /// processor, cloud sync).
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Open the state database at `config.state_path` and load the
    /// registry and last known state. Does NOT connect.
    pub async fn open(config: BridgeConfig, transport: Arc<dyn GatewayTransport>) -> Result<Self, CoreError> {
        let db = Database::open(&config.state_path).await?;
        Self::with_database(config, db, transport).await
    }

    /// Like [`open()`](Self::open) with an already opened database.
    pub async fn with_database(
        config: BridgeConfig,
        db: Database,
        transport: Arc<dyn GatewayTransport>,
    ) -> Result<Self, CoreError> {
        let store = Arc::new(StateStore::new(
            db.clone(),
            config.bucket_secs(),
            config.prediction_ttl,
        ));
        let restored = store.load().await?;
        debug!(devices = store.device_count(), buckets = restored.len(), "state restored");

        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        let (observation_tx, observation_rx) = mpsc::channel(OBSERVATION_CHANNEL_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let reconciler = Reconciler::new(Arc::clone(&store), change_tx.clone());
        let counters = reconciler.counters();
        let cancel = CancellationToken::new();

        Ok(Self {
            inner: Arc::new(BridgeInner {
                pairing: PairingManager::new(db.clone(), transport),
                config,
                db,
                store,
                connection_state,
                change_tx,
                observation_tx,
                observation_rx: Mutex::new(Some(observation_rx)),
                reconciler: Mutex::new(Some(reconciler)),
                counters,
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                reconnect_tx,
                reconnect_rx: Mutex::new(Some(reconnect_rx)),
                cancel: cancel.clone(),
                reconnect_cancel: cancel.child_token(),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                address: Mutex::new(None),
                stats: Arc::new(BridgeStats::default()),
                task_handles: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn pairing(&self) -> &PairingManager {
        &self.inner.pairing
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect to the gateway and spawn the background tasks.
    ///
    /// Pairs first when a setup code is configured and no credential is
    /// stored. Pairing outcomes that need an operator fail here; transient
    /// connection failures are handed to the reconnect loop.
    pub async fn start(&self) -> Result<(), CoreError> {
        let cloud = match self.inner.config.cloud.clone() {
            Some(cloud) => Some(
                CloudSync::new(
                    cloud,
                    self.inner.config.timeout,
                    Arc::clone(&self.inner.store),
                    self.inner.observation_tx.clone(),
                    Arc::clone(&self.inner.stats),
                )
                .await?,
            ),
            None => None,
        };
        let (Some(observation_rx), Some(reconciler), Some(command_rx), Some(reconnect_rx)) = (
            self.inner.observation_rx.lock().await.take(),
            self.inner.reconciler.lock().await.take(),
            self.inner.command_rx.lock().await.take(),
            self.inner.reconnect_rx.lock().await.take(),
        ) else {
            return Err(CoreError::Internal("bridge already started".into()));
        };
        let _ = self.inner.connection_state.send(ConnectionState::Connecting);

        let cancel = self.inner.cancel.clone();
        let mut handles = Vec::new();
        handles.push(tokio::spawn(reconciler.run(observation_rx, cancel.clone())));
        handles.push(tokio::spawn(command_processor_task(
            self.clone(),
            command_rx,
            cancel.clone(),
        )));
        *self.inner.task_handles.lock().await = handles;
        *self.inner.supervisor.lock().await = Some(tokio::spawn(supervisor::supervise(
            self.clone(),
            reconnect_rx,
            self.inner.reconnect_cancel.clone(),
        )));

        if let Err(e) = self.connect_initial().await {
            if e.is_transient() && self.inner.address.lock().await.is_some() {
                warn!(error = %e, "initial gateway connection failed; retrying in background");
                let _ = self.inner.reconnect_tx.try_send(0);
            } else {
                let _ = self.inner.connection_state.send(ConnectionState::Failed);
                self.stop_tasks().await;
                return Err(e);
            }
        }

        if let Some(sync) = cloud {
            let handle = tokio::spawn(sync.run(cancel));
            self.inner.task_handles.lock().await.push(handle);
        }

        Ok(())
    }

    async fn connect_initial(&self) -> Result<(), CoreError> {
        let target = &self.inner.config.gateway;
        let address = self.inner.pairing.select_gateway(target).await?;
        // Known before connecting so a transient failure can be retried.
        *self.inner.address.lock().await = Some(address.clone());
        let established = self
            .inner
            .pairing
            .establish_session(&address, target.setup_code.as_ref())
            .await?;
        self.attach(established).await
    }

    /// Stop in order: finish or abandon any reconnect, unsubscribe, stop
    /// timers and listeners, close the session, then drain the reconciler
    /// and stop the remaining tasks.
    pub async fn shutdown(&self) {
        info!("shutting down bridge");
        self.stop_supervisor().await;
        self.detach(true).await;
        self.stop_tasks().await;
        let _ = self.inner.connection_state.send(ConnectionState::Disconnected);
    }

    /// A reconnect in flight runs to completion, so whatever session it
    /// attaches is visible to the teardown that follows.
    async fn stop_supervisor(&self) {
        self.inner.reconnect_cancel.cancel();
        let handle = self.inner.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn stop_tasks(&self) {
        self.stop_supervisor().await;
        self.inner.cancel.cancel();
        let handles: Vec<_> = self.inner.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Ask for a fresh gateway session. Requests made while one is
    /// already pending are coalesced.
    pub fn request_reconnect(&self) {
        let generation = self.inner.generation.load(Ordering::Acquire);
        if self.inner.reconnect_tx.try_send(generation).is_err() {
            debug!("reconnect already pending");
        }
    }

    /// Connect, run `f`, shut down. Poll loops and cloud sync are
    /// disabled for the lifetime of `f`.
    pub async fn oneshot<F, Fut, T>(
        config: BridgeConfig,
        transport: Arc<dyn GatewayTransport>,
        f: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce(Bridge) -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let mut cfg = config;
        cfg.polling.fast_interval = Duration::ZERO;
        cfg.polling.slow_interval = Duration::ZERO;
        cfg.cloud = None;

        let bridge = Bridge::open(cfg, transport).await?;
        bridge.start().await?;
        let result = f(bridge.clone()).await;
        bridge.shutdown().await;
        result
    }

    // ── Session management ───────────────────────────────────────

    /// Bind an established session: load the accessory tree, register
    /// devices, subscribe, read a baseline and spawn the session tasks.
    pub(crate) async fn attach(&self, established: EstablishedSession) -> Result<(), CoreError> {
        let EstablishedSession {
            address,
            credential,
            session,
            path,
        } = established;
        if self.inner.reconnect_cancel.is_cancelled() {
            session.close().await;
            return Err(CoreError::Disconnected);
        }
        info!(%address, ?path, "gateway session established");

        match self.bind_session(Arc::clone(&session), &credential.identity_key()).await {
            Ok(live) => {
                *self.inner.address.lock().await = Some(address);
                *self.inner.session.lock().await = Some(live);
                let _ = self.inner.connection_state.send(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn bind_session(
        &self,
        session: Arc<dyn AccessorySession>,
        identity_key: &str,
    ) -> Result<LiveSession, CoreError> {
        let inner = &self.inner;
        let polling = &inner.config.polling;

        let accessories = sources::load_accessories(&inner.db, session.as_ref(), identity_key).await?;
        let by_aid = sources::register_accessories(&inner.store, &accessories).await?;
        let map = Arc::new(FieldMap::build(&accessories, &by_aid));
        for (device_id, fields) in map.fields_by_device() {
            debug!(device = %inner.store.label(device_id), ?fields, "tracked fields");
        }
        info!(devices = by_aid.len(), characteristics = map.len(), "characteristic mapping ready");

        let subscribed = map.subscribable();
        let events = session.subscribe(&subscribed).await?;

        let baseline = match sources::read_into(
            session.as_ref(),
            &map,
            &map.readable(),
            polling.batch_size,
            UpdateSource::SlowPoll,
            &inner.observation_tx,
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                if let Err(unsub) = session.unsubscribe(&subscribed).await {
                    debug!(error = %unsub, "unsubscribe after failed baseline read failed");
                }
                return Err(e);
            }
        };
        debug!(observations = baseline, "baseline read complete");

        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = inner.cancel.child_token();
        let mut handles = vec![
            tokio::spawn(sources::push_listener(
                events,
                Arc::clone(&map),
                inner.observation_tx.clone(),
                Arc::clone(&inner.stats),
                cancel.clone(),
            )),
            tokio::spawn(supervisor::watch_session(
                session.lost(),
                cancel.clone(),
                generation,
                inner.reconnect_tx.clone(),
            )),
        ];

        let fast_ids = map.fast_polled();
        if !polling.fast_interval.is_zero() && !fast_ids.is_empty() {
            let task = PollTask {
                session: Arc::clone(&session),
                map: Arc::clone(&map),
                ids: fast_ids,
                every: polling.fast_interval,
                batch_size: polling.batch_size,
                source: UpdateSource::FastPoll,
                tx: inner.observation_tx.clone(),
            };
            handles.push(tokio::spawn(task.run(cancel.clone())));
        }
        if !polling.slow_interval.is_zero() {
            let task = PollTask {
                session: Arc::clone(&session),
                map: Arc::clone(&map),
                ids: map.readable(),
                every: polling.slow_interval,
                batch_size: polling.batch_size,
                source: UpdateSource::SlowPoll,
                tx: inner.observation_tx.clone(),
            };
            handles.push(tokio::spawn(task.run(cancel.clone())));
        }

        Ok(LiveSession {
            session,
            map,
            subscribed,
            cancel,
            handles,
        })
    }

    /// Tear down the live session, if any. `unsubscribe` is skipped when
    /// the connection is already gone.
    pub(crate) async fn detach(&self, unsubscribe: bool) {
        let live = self.inner.session.lock().await.take();
        let Some(live) = live else { return };

        if unsubscribe && !live.subscribed.is_empty() {
            if let Err(e) = live.session.unsubscribe(&live.subscribed).await {
                debug!(error = %e, "unsubscribe failed");
            }
        }
        live.cancel.cancel();
        for handle in live.handles {
            let _ = handle.await;
        }
        live.session.close().await;
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Write a field on a device.
    ///
    /// Fails immediately with [`CoreError::Disconnected`] when no session
    /// is live. Current state is not touched; the new value shows up in
    /// [`predicted_state()`](Self::predicted_state) until the gateway
    /// reports it.
    pub async fn set_field(&self, device_id: DeviceId, field: TrackedField, value: f64) -> Result<(), CoreError> {
        if *self.inner.connection_state.borrow() != ConnectionState::Connected {
            return Err(CoreError::Disconnected);
        }
        if self.inner.store.device(device_id).is_none() {
            return Err(CoreError::DeviceNotFound {
                identifier: device_id.to_string(),
            });
        }
        if !field.is_writable() {
            return Err(CoreError::InvalidField {
                device_id: device_id.get(),
                field: field.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(CommandEnvelope {
                command: Command::SetField {
                    device_id,
                    field,
                    value,
                },
                response_tx: tx,
            })
            .await
            .map_err(|_| CoreError::Disconnected)?;

        rx.await.map_err(|_| CoreError::Disconnected)?
    }

    async fn route_command(&self, command: Command) -> Result<(), CoreError> {
        match command {
            Command::SetField {
                device_id,
                field,
                value,
            } => {
                let (session, map) = {
                    let guard = self.inner.session.lock().await;
                    let live = guard.as_ref().ok_or(CoreError::Disconnected)?;
                    (Arc::clone(&live.session), Arc::clone(&live.map))
                };
                let tracked = map
                    .resolve(device_id, field)
                    .filter(|c| c.writable)
                    .ok_or_else(|| CoreError::InvalidField {
                        device_id: device_id.get(),
                        field: field.to_string(),
                    })?;
                let value = command::validate_value(field, value, tracked)?;

                let write = CharacteristicWrite {
                    aid: tracked.id.aid,
                    iid: tracked.id.iid,
                    value: value.to_json(),
                };
                session.write(&[write]).await.map_err(|e| match CoreError::from(e) {
                    CoreError::RemoteWriteRejected { status, .. } => CoreError::RemoteWriteRejected {
                        field: field.to_string(),
                        status,
                    },
                    other => other,
                })?;

                self.inner.store.record_prediction(device_id, field, value);
                info!(device = %self.inner.store.label(device_id), %field, %value, "write accepted");
                Ok(())
            }
        }
    }

    // ── State observation ────────────────────────────────────────

    /// Subscribe to connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    /// Subscribe to accepted state changes.
    pub fn subscribe(&self) -> ChangeStream {
        ChangeStream::new(self.inner.change_tx.subscribe())
    }

    pub fn current_state(&self, device_id: DeviceId) -> Option<DeviceSnapshot> {
        self.inner.store.current_state(device_id)
    }

    /// Current state overlaid with unexpired write predictions.
    pub fn predicted_state(&self, device_id: DeviceId) -> Option<DeviceSnapshot> {
        self.inner.store.predicted_state(device_id)
    }

    pub fn all_current(&self) -> Vec<DeviceSnapshot> {
        self.inner.store.all_current()
    }

    pub async fn history(
        &self,
        device_id: DeviceId,
        range: HistoryRange,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        self.inner.store.history(device_id, range, limit, offset).await
    }

    pub fn history_stream(
        &self,
        device_id: DeviceId,
        range: HistoryRange,
        page_size: u32,
    ) -> Result<HistoryStream, CoreError> {
        self.inner.store.history_stream(device_id, range, page_size)
    }

    // ── Registry accessors ───────────────────────────────────────

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.store.devices_snapshot()
    }

    pub fn zones(&self) -> Vec<Arc<Zone>> {
        self.inner.store.zones_snapshot()
    }

    pub fn device_stream(&self) -> EntityStream<Device> {
        self.inner.store.subscribe_devices()
    }

    pub fn zone_stream(&self) -> EntityStream<Zone> {
        self.inner.store.subscribe_zones()
    }

    /// Find a device by id, serial number or name.
    pub fn resolve_device(&self, identifier: &str) -> Result<Arc<Device>, CoreError> {
        self.inner
            .store
            .resolve_device(identifier)
            .ok_or_else(|| CoreError::DeviceNotFound {
                identifier: identifier.to_owned(),
            })
    }

    // ── Status ───────────────────────────────────────────────────

    pub async fn status(&self) -> Result<BridgeStatus, CoreError> {
        let address = self.inner.address.lock().await.clone();
        let paired = match &address {
            Some(address) => self.inner.db.load_pairing(address).await?.is_some(),
            None => !self.inner.db.list_pairings().await?.is_empty(),
        };
        let counters = *self.inner.counters.borrow();
        let stats = &self.inner.stats;
        Ok(BridgeStatus {
            paired,
            connected: *self.inner.connection_state.borrow() == ConnectionState::Connected,
            gateway_address: address,
            events_received: stats.events_received.load(Ordering::Relaxed),
            poll_changes: counters.fast_poll + counters.slow_poll,
            cloud_syncs: stats.cloud_syncs.load(Ordering::Relaxed),
            last_cloud_sync_at: stats.last_cloud_sync_at(),
            counters,
            reconnects: stats.reconnects.load(Ordering::Relaxed),
            device_count: self.inner.store.device_count(),
        })
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Process commands from the channel one at a time.
async fn command_processor_task(
    bridge: Bridge,
    mut rx: mpsc::Receiver<CommandEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let result = bridge.route_command(envelope.command).await;
                let _ = envelope.response_tx.send(result);
            }
        }
    }
}
