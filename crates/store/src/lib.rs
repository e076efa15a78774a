//! Corral store: sharded in-RAM cache of the latest state per identity, plus
//! the ordered delta queue that hands change events to observers.

#![forbid(unsafe_code)]

pub mod dispatch;

use std::sync::{Arc, PoisonError, RwLock};

use corral_core::{ChangeEvent, FnvShardPlanner, ObjectKey, ObjectRecord, ShardPlanner};
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::debug;

pub use dispatch::{delta_queue, DeltaReceiver, DeltaSender, Dispatcher, EventHandler};

/// Name of the index every store carries by default.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Computes secondary index values for a record.
pub type IndexFn = Arc<dyn Fn(&ObjectRecord) -> Vec<String> + Send + Sync>;

type Shard = RwLock<FxHashMap<ObjectKey, Arc<ObjectRecord>>>;
type Postings = FxHashMap<String, FxHashSet<ObjectKey>>;

fn namespace_index(rec: &ObjectRecord) -> Vec<String> {
    vec![rec.key.namespace.clone().unwrap_or_default()]
}

/// Builder for [`IndexedStore`]; indexers are fixed once the store is built.
pub struct StoreBuilder {
    shards: usize,
    indexers: Vec<(String, IndexFn)>,
}

impl StoreBuilder {
    pub fn shards(mut self, n: usize) -> Self {
        self.shards = n;
        self
    }

    pub fn index(mut self, name: impl Into<String>, f: IndexFn) -> Self {
        self.indexers.push((name.into(), f));
        self
    }

    pub fn build(self) -> IndexedStore {
        let planner = FnvShardPlanner::new(self.shards);
        let shards = (0..planner.buckets()).map(|_| RwLock::new(FxHashMap::default())).collect();
        let indices = self.indexers.iter().map(|(name, _)| (name.clone(), Postings::default())).collect();
        let (epoch_tx, _) = watch::channel(0u64);
        let (synced_tx, _) = watch::channel(false);
        IndexedStore {
            inner: Arc::new(Inner {
                planner,
                shards,
                indexers: self.indexers,
                indices: RwLock::new(indices),
                epoch_tx,
                synced_tx,
            }),
        }
    }
}

struct Inner {
    planner: FnvShardPlanner,
    shards: Vec<Shard>,
    indexers: Vec<(String, IndexFn)>,
    // Lock order: shard, then indices.
    indices: RwLock<FxHashMap<String, Postings>>,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
}

/// Thread-safe cache of the latest known record per identity.
///
/// Records are replaced whole (`Arc` swap under the shard lock), so readers
/// never observe a partially applied update. An update whose
/// `resourceVersion` is not newer than the stored one is a no-op.
#[derive(Clone)]
pub struct IndexedStore {
    inner: Arc<Inner>,
}

impl Default for IndexedStore {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl IndexedStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder {
            shards: 16,
            indexers: vec![(NAMESPACE_INDEX.to_string(), Arc::new(namespace_index) as IndexFn)],
        }
    }

    fn shard(&self, key: &ObjectKey) -> &Shard {
        &self.inner.shards[self.inner.planner.plan(key) % self.inner.shards.len()]
    }

    /// Insert or replace a record. Returns the change it caused, or `None`
    /// when the stored version already supersedes (or equals) `record`.
    pub fn upsert(&self, record: ObjectRecord) -> Option<ChangeEvent> {
        let mut shard = self.shard(&record.key).write().unwrap_or_else(PoisonError::into_inner);
        let new = Arc::new(record);
        let event = match shard.get(&new.key) {
            Some(old) if old.resource_version >= new.resource_version => {
                debug!(key = %new.key, stored = %old.resource_version, seen = %new.resource_version, "stale upsert ignored");
                return None;
            }
            Some(old) => ChangeEvent::Updated { old: Arc::clone(old), new: Arc::clone(&new) },
            None => ChangeEvent::Added(Arc::clone(&new)),
        };
        let old = shard.insert(new.key.clone(), Arc::clone(&new));
        self.reindex(old.as_deref(), Some(&new));
        drop(shard);
        self.bump();
        Some(event)
    }

    /// Unconditionally remove `key`, returning the record it held.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<ObjectRecord>> {
        let mut shard = self.shard(key).write().unwrap_or_else(PoisonError::into_inner);
        let old = shard.remove(key)?;
        self.reindex(Some(&old), None);
        drop(shard);
        self.bump();
        Some(old)
    }

    /// Apply an observed deletion. Ignored when the store already holds a
    /// newer version than the deletion carries, or nothing at all.
    pub fn remove_observed(&self, record: ObjectRecord) -> Option<ChangeEvent> {
        let mut shard = self.shard(&record.key).write().unwrap_or_else(PoisonError::into_inner);
        match shard.get(&record.key) {
            Some(stored) if stored.resource_version > record.resource_version => {
                debug!(key = %record.key, stored = %stored.resource_version, seen = %record.resource_version, "stale delete ignored");
                return None;
            }
            Some(_) => {}
            None => return None,
        }
        let old = shard.remove(&record.key);
        self.reindex(old.as_deref(), None);
        drop(shard);
        self.bump();
        let mut gone = record;
        gone.deleted = true;
        Some(ChangeEvent::Deleted(Arc::new(gone)))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<ObjectRecord>> {
        self.shard(key).read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Point-in-time copy of every record. Order is unspecified.
    pub fn list(&self) -> Vec<Arc<ObjectRecord>> {
        self.list_filtered(|_| true)
    }

    pub fn list_filtered(&self, pred: impl Fn(&ObjectRecord) -> bool) -> Vec<Arc<ObjectRecord>> {
        let mut out = Vec::new();
        for shard in &self.inner.shards {
            let guard = shard.read().unwrap_or_else(PoisonError::into_inner);
            out.extend(guard.values().filter(|r| pred(r)).cloned());
        }
        out
    }

    /// Secondary lookup, e.g. `list_index(NAMESPACE_INDEX, "prod")`.
    /// Unknown index names yield an empty result.
    pub fn list_index(&self, index: &str, value: &str) -> Vec<Arc<ObjectRecord>> {
        let keys: Vec<ObjectKey> = {
            let indices = self.inner.indices.read().unwrap_or_else(PoisonError::into_inner);
            match indices.get(index).and_then(|p| p.get(value)) {
                Some(set) => set.iter().cloned().collect(),
                None => return Vec::new(),
            }
        };
        keys.iter().filter_map(|k| self.get(k)).collect()
    }

    /// Replace every record of `kind` with `snapshot`.
    ///
    /// Identities absent from the snapshot are removed (one `Deleted` each),
    /// new ones are `Added`, and ones whose version moved are `Updated`.
    /// Unchanged records produce no event.
    pub fn replace(&self, kind: &str, snapshot: Vec<ObjectRecord>) -> Vec<ChangeEvent> {
        let listed: FxHashSet<ObjectKey> = snapshot.iter().map(|r| r.key.clone()).collect();
        let mut events: Vec<ChangeEvent> = snapshot.into_iter().filter_map(|r| self.upsert(r)).collect();
        let vanished: Vec<ObjectKey> = self
            .list_filtered(|r| r.key.kind == kind && !listed.contains(&r.key))
            .into_iter()
            .map(|r| r.key.clone())
            .collect();
        for key in vanished {
            if let Some(old) = self.delete(&key) {
                events.push(ChangeEvent::Deleted(Arc::new(old.tombstone())));
            }
        }
        events
    }

    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called by the reflector once its first list has been applied.
    pub fn mark_synced(&self) {
        self.inner.synced_tx.send_replace(true);
    }

    pub fn has_synced(&self) -> bool {
        *self.inner.synced_tx.borrow()
    }

    /// Resolve once the first list has been applied.
    pub async fn wait_synced(&self) {
        let mut rx = self.inner.synced_tx.subscribe();
        // Sender lives in `inner`, so this can only fail if the store is gone.
        let _ = rx.wait_for(|s| *s).await;
    }

    /// Bumped on every mutation; lets readers wait for changes.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }

    fn bump(&self) {
        self.inner.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
        gauge!("store_objects", self.len() as f64);
    }

    fn reindex(&self, old: Option<&ObjectRecord>, new: Option<&ObjectRecord>) {
        if self.inner.indexers.is_empty() {
            return;
        }
        let mut indices = self.inner.indices.write().unwrap_or_else(PoisonError::into_inner);
        for (name, f) in &self.inner.indexers {
            let Some(postings) = indices.get_mut(name) else { continue };
            if let Some(old) = old {
                for v in f(old) {
                    if let Some(set) = postings.get_mut(&v) {
                        set.remove(&old.key);
                        if set.is_empty() {
                            postings.remove(&v);
                        }
                    }
                }
            }
            if let Some(new) = new {
                for v in f(new) {
                    postings.entry(v).or_default().insert(new.key.clone());
                }
            }
        }
    }
}
