// ── Generic reactive entity collection ──
//
// Lock-free concurrent storage with O(1) lookups and push-based
// change notification via `watch` channels.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

/// A lock-free, reactive collection for a single registry type.
///
/// Uses `DashMap` for O(1) concurrent lookups and `watch` channels
/// for push-based change notification. Every mutation bumps a version
/// counter and rebuilds the snapshot that subscribers receive.
pub(crate) struct EntityCollection<I, T>
where
    I: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Primary storage: key string -> entity.
    /// Keys are serial numbers for devices, `"zone:{id}"` for zones.
    by_key: DashMap<String, Arc<T>>,

    /// Secondary index: row id -> key string.
    id_to_key: DashMap<I, String>,

    /// Reverse of `id_to_key`, used to drop stale ids on upsert.
    key_to_id: DashMap<String, I>,

    /// Version counter, bumped on every mutation.
    version: watch::Sender<u64>,

    /// Full snapshot, rebuilt on mutation for efficient subscription.
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,
}

impl<I, T> EntityCollection<I, T>
where
    I: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            by_key: DashMap::new(),
            id_to_key: DashMap::new(),
            key_to_id: DashMap::new(),
            version,
            snapshot,
        }
    }

    /// Insert or update an entity. Returns `true` if the key was new.
    pub(crate) fn upsert(&self, key: String, id: I, entity: T) -> bool {
        // Clean up stale id mapping if the key already existed with a different id.
        if let Some(old_id) = self.key_to_id.get(&key) {
            if *old_id != id {
                self.id_to_key.remove(&*old_id);
            }
        }

        let is_new = !self.by_key.contains_key(&key);
        self.by_key.insert(key.clone(), Arc::new(entity));
        self.id_to_key.insert(id.clone(), key.clone());
        self.key_to_id.insert(key, id);

        self.rebuild_snapshot();
        self.bump_version();

        is_new
    }

    /// Look up an entity by its primary key string.
    pub(crate) fn get_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.by_key.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Look up an entity by its row id (secondary index).
    pub(crate) fn get_by_id(&self, id: &I) -> Option<Arc<T>> {
        let key = self.id_to_key.get(id)?;
        self.by_key
            .get(key.value().as_str())
            .map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn contains_id(&self, id: &I) -> bool {
        self.id_to_key.contains_key(id)
    }

    /// Get the current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes via a `watch::Receiver`.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// Collect all values into a snapshot vec and broadcast to subscribers.
    fn rebuild_snapshot(&self) {
        let values: Vec<Arc<T>> = self.by_key.iter().map(|r| Arc::clone(r.value())).collect();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::DeviceId;

    fn col() -> EntityCollection<DeviceId, String> {
        EntityCollection::new()
    }

    #[test]
    fn upsert_reports_new_keys_only_once() {
        let col = col();
        assert!(col.upsert("RU001".into(), DeviceId(1), "kitchen".into()));
        assert!(!col.upsert("RU001".into(), DeviceId(1), "kitchen".into()));
        assert_eq!(col.len(), 1);
        assert_eq!(*col.version.borrow(), 2);
    }

    #[test]
    fn get_by_key_and_id() {
        let col = col();
        col.upsert("RU001".into(), DeviceId(1), "kitchen".into());

        assert_eq!(*col.get_by_key("RU001").unwrap(), "kitchen");
        assert_eq!(*col.get_by_id(&DeviceId(1)).unwrap(), "kitchen");
        assert!(col.contains_id(&DeviceId(1)));
    }

    #[test]
    fn subscribers_see_new_snapshots() {
        let col = col();
        let mut rx = col.subscribe();
        col.upsert("a".into(), DeviceId(1), "x".into());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[test]
    fn upsert_with_changed_id_cleans_old_mapping() {
        let col = col();
        col.upsert("RU001".into(), DeviceId(1), "v1".into());
        col.upsert("RU001".into(), DeviceId(9), "v2".into());
        assert!(col.get_by_id(&DeviceId(1)).is_none());
        assert_eq!(*col.get_by_id(&DeviceId(9)).unwrap(), "v2");
    }
}
