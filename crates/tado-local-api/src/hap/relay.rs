//! HAP relay client.
//!
//! The relay is a local companion process that owns the gateway's secure
//! channel (SRP pairing, ChaCha20 session encryption) and exposes it as
//! JSON-RPC over a WebSocket. One WebSocket carries one pairing channel or
//! one accessory session.
//!
//! Frames:
//!
//! ```text
//! → {"id": 7, "method": "session.read", "params": {...}}
//! ← {"id": 7, "result": {...}}
//! ← {"id": 7, "error": {"kind": "busy", "message": "..."}}
//! ← {"event": {"aid": 2, "iid": 9, "value": 20.5}}
//! ```
//!
//! When the socket drops, every in-flight request fails with
//! [`Error::ConnectionLost`], the session's [`lost`](AccessorySession::lost)
//! token is cancelled and the push receiver ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::identity::hex;
use super::{
    Accessory, AccessorySession, CharacteristicId, CharacteristicReading, CharacteristicWrite,
    ControllerIdentity, DiscoveryInfo, GatewayTransport, PairingChannel, PairingCredential,
    Phase1Transcript, PushEvent, SetupCode,
};
use crate::error::Error;

// ── Channel capacities ───────────────────────────────────────────────

const OUTGOING_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

// ── RelayTransport ───────────────────────────────────────────────────

/// [`GatewayTransport`] backed by a HAP relay WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct RelayTransport {
    url: Url,
    request_timeout: Duration,
}

impl RelayTransport {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            request_timeout: Duration::from_secs(15),
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl GatewayTransport for RelayTransport {
    async fn open(&self, address: &str) -> Result<Box<dyn PairingChannel>, Error> {
        let conn = RelayConnection::connect(&self.url, self.request_timeout).await?;
        Ok(Box::new(RelayPairingChannel {
            conn,
            address: address.to_owned(),
        }))
    }

    async fn connect(
        &self,
        credential: &PairingCredential,
    ) -> Result<Arc<dyn AccessorySession>, Error> {
        let conn = RelayConnection::connect(&self.url, self.request_timeout).await?;
        conn.call("session.open", json!({ "credential": credential }))
            .await?;
        tracing::info!(gateway = %credential.gateway_address, "Relay session opened");
        Ok(Arc::new(RelaySession { conn }))
    }
}

// ── Pairing channel ──────────────────────────────────────────────────

struct RelayPairingChannel {
    conn: RelayConnection,
    address: String,
}

#[async_trait]
impl PairingChannel for RelayPairingChannel {
    async fn pair_phase1(&mut self, feature_flags: u8) -> Result<Phase1Transcript, Error> {
        let result = self
            .conn
            .call(
                "pair.phase1",
                json!({ "address": self.address, "feature_flags": feature_flags }),
            )
            .await?;
        decode(result)
    }

    async fn pair_phase2(
        &mut self,
        setup_code: &SetupCode,
        identity: &ControllerIdentity,
        transcript: &Phase1Transcript,
    ) -> Result<PairingCredential, Error> {
        let result = self
            .conn
            .call(
                "pair.phase2",
                json!({
                    "address": self.address,
                    "setup_code": setup_code.as_str(),
                    "transcript": transcript,
                    "controller": {
                        "pairing_id": identity.pairing_id(),
                        "ltsk": hex(&identity.secret_bytes()),
                        "ltpk": hex(&identity.public_bytes()),
                    },
                }),
            )
            .await?;
        Ok(PairingCredential {
            gateway_address: self.address.clone(),
            data: result,
        })
    }

    async fn close(&mut self) {
        self.conn.shutdown().await;
    }
}

// ── Accessory session ────────────────────────────────────────────────

struct RelaySession {
    conn: RelayConnection,
}

#[derive(Deserialize)]
struct AccessoriesResult {
    accessories: Vec<Accessory>,
}

#[derive(Deserialize)]
struct ReadResult {
    characteristics: Vec<CharacteristicReading>,
}

#[async_trait]
impl AccessorySession for RelaySession {
    async fn discovery(&self) -> Result<DiscoveryInfo, Error> {
        decode(self.conn.call("session.discovery", json!({})).await?)
    }

    async fn accessories(&self) -> Result<Vec<Accessory>, Error> {
        let result: AccessoriesResult =
            decode(self.conn.call("session.accessories", json!({})).await?)?;
        Ok(result.accessories)
    }

    async fn subscribe(
        &self,
        ids: &[CharacteristicId],
    ) -> Result<mpsc::Receiver<PushEvent>, Error> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        *lock(&self.conn.shared.events) = Some(tx);
        self.conn
            .call("session.subscribe", json!({ "characteristics": ids }))
            .await?;
        Ok(rx)
    }

    async fn unsubscribe(&self, ids: &[CharacteristicId]) -> Result<(), Error> {
        self.conn
            .call("session.unsubscribe", json!({ "characteristics": ids }))
            .await?;
        lock(&self.conn.shared.events).take();
        Ok(())
    }

    async fn read(&self, ids: &[CharacteristicId]) -> Result<Vec<CharacteristicReading>, Error> {
        let result: ReadResult = decode(
            self.conn
                .call("session.read", json!({ "characteristics": ids }))
                .await?,
        )?;
        Ok(result.characteristics)
    }

    async fn write(&self, writes: &[CharacteristicWrite]) -> Result<(), Error> {
        self.conn
            .call("session.write", json!({ "characteristics": writes }))
            .await?;
        Ok(())
    }

    fn lost(&self) -> CancellationToken {
        self.conn.shared.lost.clone()
    }

    async fn close(&self) {
        if !self.conn.shared.lost.is_cancelled() {
            if let Err(e) = self.conn.call("session.close", json!({})).await {
                tracing::debug!(error = %e, "session.close failed, dropping socket");
            }
        }
        self.conn.shutdown().await;
    }
}

// ── Wire frames ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

/// Error object carried in a response frame.
#[derive(Debug, Clone, Deserialize)]
struct RpcError {
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    aid: Option<u64>,
    #[serde(default)]
    iid: Option<u64>,
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        match e.kind.as_str() {
            "unavailable" => Self::PairingUnavailable,
            "busy" => Self::PairingBusy,
            "authentication" => Self::PairingAuthentication { message: e.message },
            "protocol" => Self::PairingProtocol { message: e.message },
            "write_rejected" => Self::WriteRejected {
                aid: e.aid.unwrap_or_default(),
                iid: e.iid.unwrap_or_default(),
                status: e.status.unwrap_or_default(),
            },
            "connection_lost" => Self::ConnectionLost,
            "timeout" => Self::Timeout { timeout_secs: 0 },
            _ => Self::Connection {
                reason: format!("{}: {}", e.kind, e.message),
            },
        }
    }
}

/// Anything the relay sends. Events have no `id`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelayFrame {
    Event {
        event: PushEvent,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RpcError>,
    },
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, Error> {
    serde_json::from_value(value.clone()).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: value.to_string(),
    })
}

// ── Connection plumbing ──────────────────────────────────────────────

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

/// State shared between request callers and the reader task.
struct Shared {
    pending: Mutex<PendingMap>,
    events: Mutex<Option<mpsc::Sender<PushEvent>>>,
    lost: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single relay WebSocket with request/response correlation.
struct RelayConnection {
    outgoing: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl RelayConnection {
    async fn connect(url: &Url, request_timeout: Duration) -> Result<Self, Error> {
        tracing::debug!(url = %url, "Connecting to HAP relay");

        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(uri)
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_CAPACITY);

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
            lost: CancellationToken::new(),
        });

        // Writer: drains the outgoing queue until the socket is lost.
        let writer_lost = shared.lost.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = writer_lost.cancelled() => break,
                    msg = outgoing_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let closing = matches!(msg, Message::Close(_));
                        if let Err(e) = write.send(msg).await {
                            tracing::debug!(error = %e, "Relay write failed");
                            writer_lost.cancel();
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        // Reader: routes responses and events, tears down on close.
        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = reader_shared.lost.cancelled() => break,
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => route_frame(&text, &reader_shared).await,
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(ref cf) = frame {
                                tracing::info!(code = %cf.code, reason = %cf.reason, "Relay closed the socket");
                            }
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Relay socket error");
                            break;
                        }
                        None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
            reader_shared.lost.cancel();
            // Dropping the senders fails every waiter with ConnectionLost.
            lock(&reader_shared.pending).clear();
            lock(&reader_shared.events).take();
            tracing::debug!("Relay reader exiting");
        });

        Ok(Self {
            outgoing,
            shared,
            next_id: AtomicU64::new(1),
            request_timeout,
        })
    }

    /// Send one request and await its response.
    async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        if self.shared.lost.is_cancelled() {
            return Err(Error::ConnectionLost);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);

        let frame = serde_json::to_string(&RpcRequest { id, method, params }).map_err(|e| {
            Error::Deserialization {
                message: e.to_string(),
                body: String::new(),
            }
        })?;
        tracing::trace!(id, method, "Relay request");

        if self.outgoing.send(Message::text(frame)).await.is_err() {
            lock(&self.shared.pending).remove(&id);
            return Err(Error::ConnectionLost);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                Err(Error::Timeout {
                    timeout_secs: self.request_timeout.as_secs(),
                })
            }
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Ok(Ok(Err(rpc))) => Err(rpc.into()),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    async fn shutdown(&self) {
        let _ = self.outgoing.send(Message::Close(None)).await;
        self.shared.lost.cancel();
    }
}

/// Route one text frame to its waiting caller or the event subscriber.
async fn route_frame(text: &str, shared: &Shared) {
    let frame: RelayFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable relay frame");
            return;
        }
    };

    match frame {
        RelayFrame::Event { event } => {
            let tx = lock(&shared.events).clone();
            match tx {
                Some(tx) => {
                    // Backpressure here only delays the reader, never drops.
                    let _ = tx.send(event).await;
                }
                None => tracing::trace!(aid = event.aid, iid = event.iid, "Event with no subscriber"),
            }
        }
        RelayFrame::Response { id, result, error } => {
            let Some(waiter) = lock(&shared.pending).remove(&id) else {
                tracing::debug!(id, "Response for unknown request");
                return;
            };
            let outcome = match error {
                Some(e) => Err(e),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = waiter.send(outcome);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
