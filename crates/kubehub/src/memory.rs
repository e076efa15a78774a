//! In-process collection with list/watch/write semantics.
//!
//! Versions come from one collection-wide revision counter, like the kube
//! apiserver. History is retained for a bounded window; watching from a
//! cursor older than the window fails with `ResourceExpired`. Failures can
//! be injected for the next list or watch calls, and active watches can be
//! broken at any time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use corral_core::{CorralError, CorralResult, ObjectKey, ObjectRecord, ResourceVersion};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::source::{ListWatcher, Listing, RemoteWriter, WatchEvent, WatchStream, WriteRequest};

const DEFAULT_WINDOW: usize = 1024;

type WatchTx = mpsc::UnboundedSender<CorralResult<WatchEvent>>;

struct State {
    objects: BTreeMap<ObjectKey, ObjectRecord>,
    revision: u64,
    history: VecDeque<WatchEvent>,
    // cursors below this can no longer be resumed
    floor: u64,
    window: usize,
    watchers: Vec<WatchTx>,
    list_failures: VecDeque<CorralError>,
    watch_failures: VecDeque<CorralError>,
    list_calls: usize,
    watch_calls: usize,
    fence: u64,
    writes: Vec<WriteRequest>,
}

pub struct MemoryCollection {
    kind: String,
    state: Mutex<State>,
}

impl MemoryCollection {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                floor: 0,
                window: DEFAULT_WINDOW,
                watchers: Vec::new(),
                list_failures: VecDeque::new(),
                watch_failures: VecDeque::new(),
                list_calls: 0,
                watch_calls: 0,
                fence: 0,
                writes: Vec::new(),
            }),
        }
    }

    /// Number of events kept for watch resumption.
    pub fn with_window(self, window: usize) -> Self {
        self.lock().window = window.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace an object. `raw` must carry `metadata.name`.
    pub fn apply(&self, raw: serde_json::Value) -> CorralResult<ObjectRecord> {
        let mut st = self.lock();
        apply_locked(&mut st, &self.kind, raw)
    }

    /// Remove an object and notify watchers.
    pub fn delete(&self, key: &ObjectKey) -> Option<ObjectRecord> {
        let mut st = self.lock();
        let mut rec = st.objects.remove(key)?;
        st.revision += 1;
        rec.resource_version = ResourceVersion(st.revision);
        let rev = st.revision.to_string();
        if let Some(meta) = rec.raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), serde_json::Value::String(rev));
        }
        publish(&mut st, WatchEvent::Deleted(rec.clone()));
        Some(rec)
    }

    /// Remove an object without any watch notification, as if the event was lost.
    pub fn delete_silently(&self, key: &ObjectKey) -> Option<ObjectRecord> {
        let mut st = self.lock();
        st.revision += 1;
        st.objects.remove(key)
    }

    /// Emit a bookmark at the current revision.
    pub fn bookmark(&self) {
        let mut st = self.lock();
        let rv = ResourceVersion(st.revision);
        publish(&mut st, WatchEvent::Bookmark(rv));
    }

    /// Compact all history: open watches fail with `ResourceExpired` and
    /// only a cursor at the current revision can still be watched from.
    pub fn expire_watches(&self) {
        let mut st = self.lock();
        st.floor = st.revision;
        st.history.clear();
        for tx in st.watchers.drain(..) {
            let _ = tx.send(Err(CorralError::ResourceExpired("history compacted".into())));
        }
    }

    /// End every open watch with `err`.
    pub fn break_watches(&self, err: CorralError) {
        let mut st = self.lock();
        for tx in st.watchers.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    pub fn fail_next_lists(&self, n: usize, err: CorralError) {
        self.lock().list_failures.extend(std::iter::repeat(err).take(n));
    }

    pub fn fail_next_watches(&self, n: usize, err: CorralError) {
        self.lock().watch_failures.extend(std::iter::repeat(err).take(n));
    }

    pub fn get(&self, key: &ObjectKey) -> Option<ObjectRecord> {
        self.lock().objects.get(key).cloned()
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.lock().watch_calls
    }

    /// Every write attempted through [`RemoteWriter`], accepted or not.
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.lock().writes.clone()
    }

    /// Highest fencing token accepted so far.
    pub fn fence(&self) -> u64 {
        self.lock().fence
    }
}

fn apply_locked(st: &mut State, kind: &str, raw: serde_json::Value) -> CorralResult<ObjectRecord> {
    let rec = stamp(kind, raw, st.revision + 1)?;
    commit(st, rec.clone());
    Ok(rec)
}

/// Parse `raw` as the next revision without touching any state.
fn stamp(kind: &str, mut raw: serde_json::Value, rev: u64) -> CorralResult<ObjectRecord> {
    let meta = raw
        .get_mut("metadata")
        .and_then(|m| m.as_object_mut())
        .ok_or_else(|| CorralError::InvalidObject(format!("{} without metadata", kind)))?;
    meta.insert("resourceVersion".into(), serde_json::Value::String(rev.to_string()));
    ObjectRecord::from_raw(kind, raw)
}

fn commit(st: &mut State, rec: ObjectRecord) {
    st.revision = rec.resource_version.0;
    let existed = st.objects.insert(rec.key.clone(), rec.clone()).is_some();
    let ev = if existed { WatchEvent::Modified(rec) } else { WatchEvent::Added(rec) };
    publish(st, ev);
}

fn publish(st: &mut State, ev: WatchEvent) {
    st.history.push_back(ev.clone());
    while st.history.len() > st.window {
        if let Some(dropped) = st.history.pop_front() {
            st.floor = dropped.resource_version().0;
        }
    }
    st.watchers.retain(|tx| tx.send(Ok(ev.clone())).is_ok());
}

#[async_trait]
impl ListWatcher for MemoryCollection {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn list(&self) -> CorralResult<Listing> {
        let mut st = self.lock();
        st.list_calls += 1;
        if let Some(err) = st.list_failures.pop_front() {
            return Err(err);
        }
        Ok(Listing { items: st.objects.values().cloned().collect(), resource_version: ResourceVersion(st.revision) })
    }

    async fn watch(&self, since: ResourceVersion) -> CorralResult<WatchStream> {
        let mut st = self.lock();
        st.watch_calls += 1;
        if let Some(err) = st.watch_failures.pop_front() {
            return Err(err);
        }
        if since.0 < st.floor {
            return Err(CorralError::ResourceExpired(format!("{} is older than {}", since, st.floor)));
        }
        let backlog: Vec<WatchEvent> =
            st.history.iter().filter(|ev| ev.resource_version() > since).cloned().collect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        st.watchers.push(tx);
        debug!(kind = %self.kind, since = %since, backlog = backlog.len(), "memory watch opened");
        let stream = async_stream::stream! {
            for ev in backlog {
                yield Ok(ev);
            }
            while let Some(item) = rx.recv().await {
                let end = item.is_err();
                yield item;
                if end {
                    break;
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[async_trait]
impl RemoteWriter for MemoryCollection {
    async fn write(&self, req: WriteRequest) -> CorralResult<ResourceVersion> {
        let mut st = self.lock();
        st.writes.push(req.clone());
        let rec = stamp(&self.kind, req.body, st.revision + 1)?;
        if rec.key != req.key {
            return Err(CorralError::InvalidObject(format!("body names {}, request names {}", rec.key, req.key)));
        }
        if let Some(token) = req.fencing_token {
            if token < st.fence {
                return Err(CorralError::Fenced { presented: token, current: st.fence });
            }
        }
        let current = st.objects.get(&req.key).map(|r| r.resource_version);
        match (req.expected_version, current) {
            (Some(exp), Some(cur)) if exp != cur => {
                return Err(CorralError::Conflict(format!("{} is at {}, expected {}", req.key, cur, exp)));
            }
            (Some(_), None) => return Err(CorralError::NotFound(req.key.to_string())),
            _ => {}
        }
        // only an accepted write raises the fence
        if let Some(token) = req.fencing_token {
            st.fence = token;
        }
        let version = rec.resource_version;
        commit(&mut st, rec);
        Ok(version)
    }
}
