//! Corral core types: object identity, versioned records and change events.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod columns;
mod error;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use error::{CorralError, CorralResult};

/// Stable identity of one managed object: `(kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn namespaced(kind: impl Into<String>, namespace: &str, name: impl Into<String>) -> Self {
        Self::new(kind, Some(namespace), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Per-object monotonically increasing version token.
///
/// The remote side hands these out as strings; in practice they are decimal
/// revisions, which gives us a total order to reject stale updates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ResourceVersion(pub u64);

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceVersion {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| CorralError::InvalidObject(format!("unparsable resourceVersion {:?}", s)))
    }
}

/// Latest known state of one object as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub key: ObjectKey,
    pub resource_version: ResourceVersion,
    /// Creation time, seconds since epoch.
    pub creation_ts: Option<i64>,
    /// Soft-deletion marker, seconds since epoch.
    pub deletion_ts: Option<i64>,
    /// Set once removal has been confirmed by the remote side.
    pub deleted: bool,
    /// Full object (spec + status); opaque to the runtime.
    pub raw: serde_json::Value,
}

impl ObjectRecord {
    /// Build a record from a raw object carrying standard `metadata`.
    pub fn from_raw(kind: &str, raw: serde_json::Value) -> CorralResult<Self> {
        let meta = raw
            .get("metadata")
            .ok_or_else(|| CorralError::InvalidObject(format!("{} without metadata", kind)))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CorralError::InvalidObject(format!("{} without metadata.name", kind)))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let resource_version = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CorralError::InvalidObject(format!("{} {} without resourceVersion", kind, name)))?
            .parse::<ResourceVersion>()?;
        let creation_ts = meta.get("creationTimestamp").and_then(|v| v.as_str()).and_then(parse_ts);
        let deletion_ts = meta.get("deletionTimestamp").and_then(|v| v.as_str()).and_then(parse_ts);
        Ok(Self {
            key: ObjectKey { kind: kind.to_string(), namespace, name },
            resource_version,
            creation_ts,
            deletion_ts,
            deleted: false,
            raw,
        })
    }

    /// True while the object is soft-deleted but not yet gone.
    pub fn is_terminating(&self) -> bool {
        self.deletion_ts.is_some() && !self.deleted
    }

    /// Copy of this record marked as confirmed-deleted.
    pub fn tombstone(&self) -> Self {
        let mut out = self.clone();
        out.deleted = true;
        out
    }
}

fn parse_ts(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}

/// Normalized change notification produced by the reflector.
///
/// Records are shared with the store; events never own a mutable copy.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added(Arc<ObjectRecord>),
    Updated { old: Arc<ObjectRecord>, new: Arc<ObjectRecord> },
    Deleted(Arc<ObjectRecord>),
}

impl ChangeEvent {
    pub fn key(&self) -> &ObjectKey {
        &self.record().key
    }

    /// The record the event is about (the new state for updates).
    pub fn record(&self) -> &Arc<ObjectRecord> {
        match self {
            ChangeEvent::Added(r) | ChangeEvent::Deleted(r) => r,
            ChangeEvent::Updated { new, .. } => new,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "ADDED",
            ChangeEvent::Updated { .. } => "UPDATED",
            ChangeEvent::Deleted(_) => "DELETED",
        }
    }
}

pub mod prelude {
    pub use super::{ChangeEvent, CorralError, CorralResult, ObjectKey, ObjectRecord, ResourceVersion, ShardPlanner};
}

// ---- sharding primitives ----

/// Maps an identity onto one of a fixed number of lock shards.
pub trait ShardPlanner: Send + Sync {
    fn buckets(&self) -> usize;
    fn plan(&self, key: &ObjectKey) -> usize;
}

/// Default planner: FNV-1a over kind, namespace and name, modulo bucket count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FnvShardPlanner {
    buckets: u16,
}

impl FnvShardPlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.clamp(1, u16::MAX as usize) as u16 }
    }
}

impl ShardPlanner for FnvShardPlanner {
    fn buckets(&self) -> usize {
        self.buckets as usize
    }

    fn plan(&self, key: &ObjectKey) -> usize {
        if self.buckets <= 1 {
            return 0;
        }
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        let ns = key.namespace.as_deref().unwrap_or("");
        for part in [key.kind.as_bytes(), b"\0", ns.as_bytes(), b"\0", key.name.as_bytes()] {
            for b in part {
                h ^= *b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
        }
        (h % self.buckets as u64) as usize
    }
}
