//! Shared lease record and the compare-and-swap store it lives in.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_core::{CorralError, CorralResult, ResourceVersion};
use rustc_hash::FxHashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// `None` once released.
    pub holder: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub lease_duration: Duration,
    /// Incremented on every change of holder.
    pub fencing_token: u64,
}

/// A lease record plus the version to CAS against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    pub record: LeaseRecord,
    pub version: ResourceVersion,
}

/// Linearizable home of one lease.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self) -> CorralResult<Option<VersionedLease>>;

    /// Fails with `Conflict` if the lease already exists.
    async fn create(&self, record: &LeaseRecord) -> CorralResult<ResourceVersion>;

    /// Fails with `Conflict` unless the stored version equals `expected`.
    async fn update(&self, record: &LeaseRecord, expected: ResourceVersion) -> CorralResult<ResourceVersion>;
}

#[derive(Default)]
struct Shared {
    lease: Option<VersionedLease>,
    next_version: u64,
    partitioned: FxHashSet<String>,
}

/// In-process lease store. Each candidate talks to it through its own
/// [`MemoryLeaseClient`] so partitions can be injected per identity.
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client(&self, identity: impl Into<String>) -> MemoryLeaseClient {
        MemoryLeaseClient { store: self.clone(), identity: identity.into() }
    }

    /// Cut `identity` off: every call it makes fails with a transport error.
    pub fn partition(&self, identity: &str) {
        self.lock().partitioned.insert(identity.to_string());
    }

    pub fn heal(&self, identity: &str) {
        self.lock().partitioned.remove(identity);
    }

    pub fn current(&self) -> Option<LeaseRecord> {
        self.lock().lease.as_ref().map(|l| l.record.clone())
    }
}

pub struct MemoryLeaseClient {
    store: MemoryLeaseStore,
    identity: String,
}

impl MemoryLeaseClient {
    fn reachable(&self) -> CorralResult<MutexGuard<'_, Shared>> {
        let shared = self.store.lock();
        if shared.partitioned.contains(&self.identity) {
            return Err(CorralError::Transport(format!("{} is partitioned", self.identity)));
        }
        Ok(shared)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseClient {
    async fn get(&self) -> CorralResult<Option<VersionedLease>> {
        Ok(self.reachable()?.lease.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> CorralResult<ResourceVersion> {
        let mut shared = self.reachable()?;
        if shared.lease.is_some() {
            return Err(CorralError::Conflict("lease exists".into()));
        }
        shared.next_version += 1;
        let version = ResourceVersion(shared.next_version);
        shared.lease = Some(VersionedLease { record: record.clone(), version });
        Ok(version)
    }

    async fn update(&self, record: &LeaseRecord, expected: ResourceVersion) -> CorralResult<ResourceVersion> {
        let mut shared = self.reachable()?;
        match shared.lease.as_ref().map(|l| l.version) {
            Some(v) if v == expected => {}
            Some(v) => return Err(CorralError::Conflict(format!("lease at {}, expected {}", v, expected))),
            None => return Err(CorralError::NotFound("lease".into())),
        }
        shared.next_version += 1;
        let version = ResourceVersion(shared.next_version);
        shared.lease = Some(VersionedLease { record: record.clone(), version });
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(holder: &str, token: u64) -> LeaseRecord {
        LeaseRecord {
            holder: Some(holder.into()),
            acquired_at: None,
            renewed_at: None,
            lease_duration: Duration::from_secs(15),
            fencing_token: token,
        }
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = MemoryLeaseStore::new();
        let a = store.client("a");
        let b = store.client("b");
        let v1 = a.create(&rec("a", 1)).await.unwrap();
        assert!(matches!(b.create(&rec("b", 1)).await, Err(CorralError::Conflict(_))));
        let v2 = a.update(&rec("a", 1), v1).await.unwrap();
        assert!(matches!(b.update(&rec("b", 2), v1).await, Err(CorralError::Conflict(_))));
        b.update(&rec("b", 2), v2).await.unwrap();
        assert_eq!(store.current().unwrap().holder.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn partition_is_per_identity() {
        let store = MemoryLeaseStore::new();
        store.partition("a");
        assert!(store.client("a").get().await.unwrap_err().is_transient());
        assert!(store.client("b").get().await.unwrap().is_none());
        store.heal("a");
        assert!(store.client("a").get().await.is_ok());
    }
}
