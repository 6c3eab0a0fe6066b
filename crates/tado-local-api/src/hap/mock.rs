//! In-memory gateway for tests.
//!
//! [`MockGateway`] implements [`GatewayTransport`] against a scripted
//! accessory database. Tests drive it from the outside: change values with
//! or without a push event, drop the connection, make pairing phases fail,
//! and inspect what the code under test did (`log`, `reads`, `writes`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::uuid;
use super::{
    Accessory, AccessorySession, Characteristic, CharacteristicId, CharacteristicReading,
    CharacteristicWrite, ControllerIdentity, DiscoveryInfo, GatewayTransport, PairingChannel,
    PairingCredential, Phase1Transcript, PushEvent, Service, SetupCode,
};
use crate::error::Error;

/// Setup code the mock accepts unless overridden.
pub const DEFAULT_SETUP_CODE: &str = "123-45-678";

/// Instance ids used by [`thermostat_accessory`].
pub mod iids {
    pub const NAME: u64 = 2;
    pub const SERIAL: u64 = 3;
    pub const MODEL: u64 = 4;
    pub const MANUFACTURER: u64 = 5;
    pub const CURRENT_TEMPERATURE: u64 = 9;
    pub const TARGET_TEMPERATURE: u64 = 10;
    pub const CURRENT_HEATING_COOLING_STATE: u64 = 11;
    pub const TARGET_HEATING_COOLING_STATE: u64 = 12;
    pub const HUMIDITY: u64 = 13;
    pub const BATTERY_LOW: u64 = 14;
}

// ── Fixtures ─────────────────────────────────────────────────────────

fn characteristic(iid: u64, short: &str, perms: &[&str], format: &str, value: Value) -> Characteristic {
    Characteristic {
        iid,
        char_type: uuid::normalize(short),
        perms: perms.iter().map(|p| (*p).to_owned()).collect(),
        format: Some(format.to_owned()),
        value: Some(value),
        min_value: None,
        max_value: None,
        min_step: None,
        unit: None,
    }
}

/// A tado-style thermostat: information service plus a thermostat service
/// with temperature, mode, humidity and battery characteristics.
pub fn thermostat_accessory(aid: u64, serial: &str, name: &str) -> Accessory {
    let mut target_temp = characteristic(iids::TARGET_TEMPERATURE, "35", &["pr", "pw", "ev"], "float", json!(20.0));
    target_temp.min_value = Some(5.0);
    target_temp.max_value = Some(25.0);
    target_temp.min_step = Some(0.1);
    let mut target_mode =
        characteristic(iids::TARGET_HEATING_COOLING_STATE, "33", &["pr", "pw", "ev"], "uint8", json!(1));
    target_mode.min_value = Some(0.0);
    target_mode.max_value = Some(3.0);

    Accessory {
        aid,
        services: vec![
            Service {
                iid: 1,
                service_type: uuid::SERVICE_ACCESSORY_INFORMATION.into(),
                primary: None,
                characteristics: vec![
                    characteristic(iids::NAME, "23", &["pr"], "string", json!(name)),
                    characteristic(iids::SERIAL, "30", &["pr"], "string", json!(serial)),
                    characteristic(iids::MODEL, "21", &["pr"], "string", json!("RU02")),
                    characteristic(iids::MANUFACTURER, "20", &["pr"], "string", json!("tado")),
                ],
            },
            Service {
                iid: 8,
                service_type: uuid::SERVICE_THERMOSTAT.into(),
                primary: Some(true),
                characteristics: vec![
                    characteristic(iids::CURRENT_TEMPERATURE, "11", &["pr", "ev"], "float", json!(19.0)),
                    target_temp,
                    characteristic(iids::CURRENT_HEATING_COOLING_STATE, "0F", &["pr", "ev"], "uint8", json!(0)),
                    target_mode,
                    characteristic(iids::HUMIDITY, "10", &["pr", "ev"], "float", json!(45.0)),
                    characteristic(iids::BATTERY_LOW, "79", &["pr", "ev"], "uint8", json!(0)),
                ],
            },
        ],
    }
}

// ── State ────────────────────────────────────────────────────────────

struct LiveSession {
    generation: u64,
    lost: CancellationToken,
    events: Option<mpsc::Sender<PushEvent>>,
}

struct MockState {
    accessories: Vec<Accessory>,
    values: HashMap<CharacteristicId, Value>,
    null_reads: HashSet<CharacteristicId>,
    discovery: DiscoveryInfo,

    setup_code: String,
    unavailable: bool,
    required_feature_flags: Option<u8>,
    phase2_failures: usize,
    phase1_calls: Vec<u8>,
    phase2_transcripts: Vec<Phase1Transcript>,
    open_calls: usize,
    transcripts_issued: u64,

    connect_failures: usize,
    connect_calls: usize,
    enumerate_calls: usize,
    generation: u64,
    live: Option<LiveSession>,
    subscribed: HashSet<CharacteristicId>,
    reject_writes: Option<i64>,
    writes: Vec<CharacteristicWrite>,
    reads: Vec<Vec<CharacteristicId>>,
    subscribe_gate: Option<SubscribeGate>,
    log: Vec<String>,
}

/// Holds one `subscribe` call after it has registered its ids.
#[derive(Clone, Default)]
pub struct SubscribeGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl SubscribeGate {
    /// Resolves once a `subscribe` call is parked on this gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the parked `subscribe` return.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

fn lock(m: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── MockGateway ──────────────────────────────────────────────────────

/// Scriptable in-memory gateway. Clones share state.
#[derive(Clone)]
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockGateway {
    pub fn new(accessories: Vec<Accessory>) -> Self {
        let values = accessories
            .iter()
            .flat_map(|a| {
                a.characteristics()
                    .filter_map(|(id, c)| c.value.clone().map(|v| (id, v)))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(MockState {
                accessories,
                values,
                null_reads: HashSet::new(),
                discovery: DiscoveryInfo {
                    config_version: Some(1),
                    state_number: Some(1),
                    broadcast_key: None,
                },
                setup_code: DEFAULT_SETUP_CODE.into(),
                unavailable: false,
                required_feature_flags: None,
                phase2_failures: 0,
                phase1_calls: Vec::new(),
                phase2_transcripts: Vec::new(),
                open_calls: 0,
                transcripts_issued: 0,
                connect_failures: 0,
                connect_calls: 0,
                enumerate_calls: 0,
                generation: 0,
                live: None,
                subscribed: HashSet::new(),
                reject_writes: None,
                writes: Vec::new(),
                reads: Vec::new(),
                subscribe_gate: None,
                log: Vec::new(),
            })),
        }
    }

    // ── Scripting ────────────────────────────────────────────────────

    /// Change a value without notifying subscribers (only polls see it).
    pub fn set_value(&self, id: CharacteristicId, value: Value) {
        let mut st = lock(&self.state);
        st.null_reads.remove(&id);
        st.values.insert(id, value);
    }

    /// Change a value and push it to the subscriber, if subscribed.
    pub fn push(&self, id: CharacteristicId, value: Value) {
        let tx = {
            let mut st = lock(&self.state);
            st.values.insert(id, value.clone());
            if st.subscribed.contains(&id) {
                st.live.as_ref().and_then(|l| l.events.clone())
            } else {
                None
            }
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(PushEvent {
                aid: id.aid,
                iid: id.iid,
                value: Some(value),
            });
        }
    }

    /// Push a null value (a read glitch) without changing the stored value.
    pub fn push_null(&self, id: CharacteristicId) {
        let tx = lock(&self.state).live.as_ref().and_then(|l| l.events.clone());
        if let Some(tx) = tx {
            let _ = tx.try_send(PushEvent {
                aid: id.aid,
                iid: id.iid,
                value: None,
            });
        }
    }

    /// Make reads of `id` answer null until the next `set_value`.
    pub fn set_null_read(&self, id: CharacteristicId) {
        lock(&self.state).null_reads.insert(id);
    }

    /// Simulate a transport drop of the live session.
    pub fn drop_connection(&self) {
        let mut st = lock(&self.state);
        if let Some(live) = st.live.take() {
            live.lost.cancel();
        }
        st.subscribed.clear();
        st.log.push("dropped".into());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn set_setup_code(&self, code: &str) {
        lock(&self.state).setup_code = code.into();
    }

    /// Phase 1 succeeds only with these feature flags.
    pub fn require_feature_flags(&self, flags: u8) {
        lock(&self.state).required_feature_flags = Some(flags);
    }

    /// The next `n` phase-2 attempts fail with a protocol error.
    pub fn fail_next_phase2(&self, n: usize) {
        lock(&self.state).phase2_failures = n;
    }

    /// The next `n` connects fail with a connection error.
    pub fn fail_next_connects(&self, n: usize) {
        lock(&self.state).connect_failures = n;
    }

    /// The next `subscribe` registers its ids, then waits on the gate.
    pub fn hold_next_subscribe(&self) -> SubscribeGate {
        let gate = SubscribeGate::default();
        lock(&self.state).subscribe_gate = Some(gate.clone());
        gate
    }

    pub fn reject_writes(&self, status: Option<i64>) {
        lock(&self.state).reject_writes = status;
    }

    pub fn set_config_version(&self, version: u64) {
        lock(&self.state).discovery.config_version = Some(version);
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn phase1_calls(&self) -> Vec<u8> {
        lock(&self.state).phase1_calls.clone()
    }

    pub fn phase2_transcripts(&self) -> Vec<Phase1Transcript> {
        lock(&self.state).phase2_transcripts.clone()
    }

    pub fn open_calls(&self) -> usize {
        lock(&self.state).open_calls
    }

    pub fn connect_calls(&self) -> usize {
        lock(&self.state).connect_calls
    }

    pub fn enumerate_calls(&self) -> usize {
        lock(&self.state).enumerate_calls
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).live.is_some()
    }

    pub fn subscribed(&self) -> HashSet<CharacteristicId> {
        lock(&self.state).subscribed.clone()
    }

    pub fn writes(&self) -> Vec<CharacteristicWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn reads(&self) -> Vec<Vec<CharacteristicId>> {
        lock(&self.state).reads.clone()
    }

    pub fn value(&self, id: CharacteristicId) -> Option<Value> {
        lock(&self.state).values.get(&id).cloned()
    }

    /// Structural operations in call order: `connect`, `subscribe`,
    /// `unsubscribe`, `close`, `dropped`.
    pub fn log(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }
}

#[async_trait]
impl GatewayTransport for MockGateway {
    async fn open(&self, address: &str) -> Result<Box<dyn PairingChannel>, Error> {
        lock(&self.state).open_calls += 1;
        Ok(Box::new(MockPairingChannel {
            state: Arc::clone(&self.state),
            address: address.to_owned(),
            closed: false,
        }))
    }

    async fn connect(
        &self,
        credential: &PairingCredential,
    ) -> Result<Arc<dyn AccessorySession>, Error> {
        let mut st = lock(&self.state);
        st.connect_calls += 1;
        if st.connect_failures > 0 {
            st.connect_failures -= 1;
            return Err(Error::Connection {
                reason: format!("{} did not answer", credential.gateway_address),
            });
        }
        if let Some(previous) = st.live.take() {
            previous.lost.cancel();
        }
        st.generation += 1;
        let generation = st.generation;
        let lost = CancellationToken::new();
        st.live = Some(LiveSession {
            generation,
            lost: lost.clone(),
            events: None,
        });
        st.log.push("connect".into());
        Ok(Arc::new(MockSession {
            state: Arc::clone(&self.state),
            generation,
            lost,
        }))
    }
}

// ── Pairing channel ──────────────────────────────────────────────────

struct MockPairingChannel {
    state: Arc<Mutex<MockState>>,
    address: String,
    closed: bool,
}

#[async_trait]
impl PairingChannel for MockPairingChannel {
    async fn pair_phase1(&mut self, feature_flags: u8) -> Result<Phase1Transcript, Error> {
        if self.closed {
            return Err(Error::ConnectionLost);
        }
        let mut st = lock(&self.state);
        st.phase1_calls.push(feature_flags);
        if st.unavailable {
            return Err(Error::PairingUnavailable);
        }
        if st.required_feature_flags.is_some_and(|f| f != feature_flags) {
            return Err(Error::PairingProtocol {
                message: format!("feature flags {feature_flags} not accepted"),
            });
        }
        st.transcripts_issued += 1;
        Ok(Phase1Transcript {
            salt: format!("salt-{}", st.transcripts_issued),
            public_key: format!("pk-{}", st.transcripts_issued),
        })
    }

    async fn pair_phase2(
        &mut self,
        setup_code: &SetupCode,
        identity: &ControllerIdentity,
        transcript: &Phase1Transcript,
    ) -> Result<PairingCredential, Error> {
        if self.closed {
            return Err(Error::ConnectionLost);
        }
        let mut st = lock(&self.state);
        st.phase2_transcripts.push(transcript.clone());
        if st.phase2_failures > 0 {
            st.phase2_failures -= 1;
            return Err(Error::PairingProtocol {
                message: "M6 verification failed".into(),
            });
        }
        if setup_code.as_str() != st.setup_code {
            return Err(Error::PairingAuthentication {
                message: "incorrect setup code".into(),
            });
        }
        Ok(PairingCredential {
            gateway_address: self.address.clone(),
            data: json!({
                "AccessoryPairingID": "MOCK-GATEWAY",
                "iOSPairingId": identity.pairing_id(),
                "AccessoryIP": self.address,
            }),
        })
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

// ── Session ──────────────────────────────────────────────────────────

struct MockSession {
    state: Arc<Mutex<MockState>>,
    generation: u64,
    lost: CancellationToken,
}

impl MockSession {
    fn check(&self) -> Result<MutexGuard<'_, MockState>, Error> {
        if self.lost.is_cancelled() {
            return Err(Error::ConnectionLost);
        }
        Ok(lock(&self.state))
    }
}

#[async_trait]
impl AccessorySession for MockSession {
    async fn discovery(&self) -> Result<DiscoveryInfo, Error> {
        Ok(self.check()?.discovery.clone())
    }

    async fn accessories(&self) -> Result<Vec<Accessory>, Error> {
        let mut st = self.check()?;
        st.enumerate_calls += 1;
        let values = st.values.clone();
        let mut tree = st.accessories.clone();
        for acc in &mut tree {
            let aid = acc.aid;
            for svc in &mut acc.services {
                for c in &mut svc.characteristics {
                    c.value = values.get(&CharacteristicId::new(aid, c.iid)).cloned();
                }
            }
        }
        Ok(tree)
    }

    async fn subscribe(
        &self,
        ids: &[CharacteristicId],
    ) -> Result<mpsc::Receiver<PushEvent>, Error> {
        let (rx, gate) = {
            let mut st = self.check()?;
            let (tx, rx) = mpsc::channel(256);
            if let Some(live) = st.live.as_mut() {
                live.events = Some(tx);
            }
            st.subscribed.extend(ids.iter().copied());
            st.log.push("subscribe".into());
            (rx, st.subscribe_gate.take())
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, ids: &[CharacteristicId]) -> Result<(), Error> {
        let mut st = self.check()?;
        for id in ids {
            st.subscribed.remove(id);
        }
        if let Some(live) = st.live.as_mut() {
            live.events = None;
        }
        st.log.push("unsubscribe".into());
        Ok(())
    }

    async fn read(&self, ids: &[CharacteristicId]) -> Result<Vec<CharacteristicReading>, Error> {
        let mut st = self.check()?;
        st.reads.push(ids.to_vec());
        Ok(ids
            .iter()
            .map(|id| {
                let value = if st.null_reads.contains(id) {
                    None
                } else {
                    st.values.get(id).cloned()
                };
                CharacteristicReading {
                    aid: id.aid,
                    iid: id.iid,
                    status: value.is_none().then_some(-70402),
                    value,
                }
            })
            .collect())
    }

    async fn write(&self, writes: &[CharacteristicWrite]) -> Result<(), Error> {
        let mut st = self.check()?;
        if let Some(status) = st.reject_writes {
            let first = writes.first().map_or((0, 0), |w| (w.aid, w.iid));
            return Err(Error::WriteRejected {
                aid: first.0,
                iid: first.1,
                status,
            });
        }
        for w in writes {
            st.values
                .insert(CharacteristicId::new(w.aid, w.iid), w.value.clone());
            st.writes.push(w.clone());
        }
        Ok(())
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) {
        let mut st = lock(&self.state);
        st.log.push("close".into());
        if st.live.as_ref().is_some_and(|l| l.generation == self.generation) {
            st.live = None;
        }
        self.lost.cancel();
    }
}
