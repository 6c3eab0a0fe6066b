// ── Domain model ──
//
// Types shared by the pairing manager, the reconciler and the state store.

pub mod device;
pub mod field;
pub mod ids;
pub mod state;

pub use device::{Device, DeviceKind, DeviceRegistration, Zone};
pub use field::{FieldValue, TrackedField, ValueKind};
pub use ids::{DeviceId, ZoneId};
pub use state::{
    BridgeStatus, DeviceSnapshot, FieldState, HistoryRange, HistoryRecord, Observation,
    SourceCounters, StateChange, UpdateSource,
};
