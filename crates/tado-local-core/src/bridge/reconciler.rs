// ── Change reconciliation ──
//
// Every source (push listener, both poll loops, cloud sync) feeds raw
// observations into one bounded channel. A single consumer drains it, so
// "compare with last value, then update" never races.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::CoreError;
use crate::model::{DeviceId, FieldValue, Observation, SourceCounters, StateChange, TrackedField};
use crate::store::StateStore;

/// Deduplicates observations and commits accepted changes.
///
/// The last-accepted cache survives reconnects, so a fresh session's
/// baseline read does not re-emit values that did not change.
pub struct Reconciler {
    store: Arc<StateStore>,
    last: HashMap<(DeviceId, TrackedField), FieldValue>,
    changes: broadcast::Sender<StateChange>,
    counters: watch::Sender<SourceCounters>,
}

impl Reconciler {
    /// Create a reconciler seeded with the store's current state.
    pub fn new(store: Arc<StateStore>, changes: broadcast::Sender<StateChange>) -> Self {
        let last = store
            .all_current()
            .into_iter()
            .flat_map(|snap| {
                let device_id = snap.device_id;
                snap.fields
                    .into_iter()
                    .map(move |(field, state)| ((device_id, field), state.value))
            })
            .collect();
        let (counters, _) = watch::channel(SourceCounters::default());
        Self {
            store,
            last,
            changes,
            counters,
        }
    }

    /// Live view of the per-source counters.
    pub fn counters(&self) -> watch::Receiver<SourceCounters> {
        self.counters.subscribe()
    }

    /// Apply one observation. Returns the accepted change, or `None` when
    /// the value was null or equal to the last accepted one.
    pub async fn apply(&mut self, obs: Observation) -> Result<Option<StateChange>, CoreError> {
        let key = (obs.device_id, obs.field);
        let Some(value) = obs.value else {
            self.counters.send_modify(|c| c.discarded_null += 1);
            debug!(device_id = %obs.device_id, field = %obs.field, source = %obs.source, "null value discarded");
            return Ok(None);
        };
        if self.last.get(&key) == Some(&value) {
            self.counters.send_modify(|c| c.discarded_duplicate += 1);
            trace!(device_id = %obs.device_id, field = %obs.field, source = %obs.source, "duplicate value");
            return Ok(None);
        }

        let update = self
            .store
            .update_field(obs.device_id, obs.field, value, obs.observed_at, obs.source)
            .await?;
        self.last.insert(key, value);
        self.counters.send_modify(|c| c.record(obs.source));

        let previous = update
            .previous
            .map_or_else(|| "None".to_owned(), |v| v.to_string());
        info!(
            "[{}] {} | {}: {} -> {}",
            obs.source,
            self.store.label(obs.device_id),
            obs.field,
            previous,
            value
        );

        let change = StateChange {
            device_id: obs.device_id,
            field: obs.field,
            value,
            previous_value: update.previous,
            source: obs.source,
            timestamp: obs.observed_at,
        };
        // No subscribers is fine.
        let _ = self.changes.send(change.clone());
        Ok(Some(change))
    }

    /// Drain `rx` until it closes or `cancel` fires. Observations already
    /// queued at cancellation are still applied.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Observation>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                obs = rx.recv() => {
                    let Some(obs) = obs else { break };
                    self.apply_logged(obs).await;
                }
            }
        }
        rx.close();
        while let Ok(obs) = rx.try_recv() {
            self.apply_logged(obs).await;
        }
        debug!("reconciler stopped");
    }

    async fn apply_logged(&mut self, obs: Observation) {
        let (device_id, field) = (obs.device_id, obs.field);
        if let Err(e) = self.apply(obs).await {
            warn!(%device_id, %field, error = %e, "failed to apply observation");
        }
    }
}
