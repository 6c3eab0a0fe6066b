//! Pairing, state reconciliation and time-bucketed storage for a tado
//! gateway exposed over HomeKit.
//!
//! - **[`Bridge`]**: central facade. [`start()`](Bridge::start) pairs or
//!   reconnects, reads a baseline and spawns the push listener, both poll
//!   loops, the reconnect supervisor and the optional cloud sync.
//!   [`Bridge::oneshot()`](Bridge::oneshot) runs a single operation for CLI
//!   use.
//!
//! - **[`Reconciler`]**: the single consumer of every observation. Drops
//!   nulls and repeats, commits accepted values and broadcasts
//!   [`StateChange`]s.
//!
//! - **[`StateStore`]**: device registry, in-memory current state and the
//!   write-on-change history table with fixed-width buckets.
//!
//! - **[`PairingManager`]**: controller identity, stored credentials and the
//!   two-phase pairing handshake with checkpointing.
//!
//! - **[`db::Database`]**: the single SQLite file holding everything durable.

pub mod bridge;
pub mod cloud;
pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod pairing;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::reconciler::Reconciler;
pub use bridge::{Bridge, ConnectionState};
pub use command::Command;
pub use config::{BridgeConfig, CloudConfig, GatewayTarget, PollingConfig, ReconnectConfig};
pub use error::CoreError;
pub use pairing::{EstablishedSession, PairingManager, PairingPath};
pub use store::{HistoryStream, StateStore};
pub use stream::{ChangeStream, EntityStream};

pub use model::{
    BridgeStatus, Device, DeviceId, DeviceKind, DeviceRegistration, DeviceSnapshot, FieldState,
    FieldValue, HistoryRange, HistoryRecord, Observation, SourceCounters, StateChange,
    TrackedField, UpdateSource, Zone, ZoneId,
};
