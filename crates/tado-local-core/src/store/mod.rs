// ── State store ──
//
// Device/zone registry, in-memory current state and bucketed history.

mod collection;
mod ledger;
mod state_store;

pub use ledger::{HistoryWrite, bucket_of};
pub use state_store::{FieldUpdate, HistoryStream, StateStore};
