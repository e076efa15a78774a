//! `coordination.k8s.io/v1` Lease as the lease store.
//!
//! The fencing token is kept in `spec.leaseTransitions`, which the stock
//! client-go elector also bumps on every change of holder.

use std::time::Duration;

use async_trait::async_trait;
use corral_core::{CorralError, CorralResult, ResourceVersion};
use corral_kubehub::map_kube_error;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;

use crate::lease::{LeaseRecord, LeaseStore, VersionedLease};

pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), name: name.to_string(), namespace: namespace.to_string() }
    }

    fn to_lease(&self, record: &LeaseRecord, version: Option<ResourceVersion>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(|v| v.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder.clone(),
                acquire_time: record.acquired_at.map(MicroTime),
                renew_time: record.renewed_at.map(MicroTime),
                lease_duration_seconds: Some(record.lease_duration.as_secs().min(i32::MAX as u64) as i32),
                lease_transitions: Some(record.fencing_token.min(i32::MAX as u64) as i32),
                ..Default::default()
            }),
        }
    }
}

fn version_of(lease: &Lease) -> CorralResult<ResourceVersion> {
    lease
        .metadata
        .resource_version
        .as_deref()
        .ok_or_else(|| CorralError::InvalidObject("lease without resourceVersion".into()))?
        .parse()
}

fn from_lease(lease: &Lease) -> CorralResult<VersionedLease> {
    let spec = lease.spec.clone().unwrap_or_default();
    let record = LeaseRecord {
        holder: spec.holder_identity.filter(|h| !h.is_empty()),
        acquired_at: spec.acquire_time.map(|t| t.0),
        renewed_at: spec.renew_time.map(|t| t.0),
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        fencing_token: spec.lease_transitions.unwrap_or(0).max(0) as u64,
    };
    Ok(VersionedLease { record, version: version_of(lease)? })
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> CorralResult<Option<VersionedLease>> {
        match self.api.get_opt(&self.name).await.map_err(map_kube_error)? {
            Some(lease) => Ok(Some(from_lease(&lease)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> CorralResult<ResourceVersion> {
        let created = self.api.create(&PostParams::default(), &self.to_lease(record, None)).await.map_err(map_kube_error)?;
        version_of(&created)
    }

    async fn update(&self, record: &LeaseRecord, expected: ResourceVersion) -> CorralResult<ResourceVersion> {
        let lease = self.to_lease(record, Some(expected));
        let replaced = self.api.replace(&self.name, &PostParams::default(), &lease).await.map_err(map_kube_error)?;
        version_of(&replaced)
    }
}
