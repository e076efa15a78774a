//! Corral leader coordination.
//!
//! One lease record, many candidates. The holder renews every
//! `retry_period`; a renewal that fails or times out demotes it at once.
//! Other candidates only take over after the record has stayed unchanged
//! for a full `lease_duration`, measured on their own clock. Each acquisition
//! bumps the fencing token, which leader writes carry so a deposed leader's
//! late write is rejected downstream.

#![forbid(unsafe_code)]

mod kube_lease;
mod lease;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use corral_core::{CorralError, CorralResult, ResourceVersion};
use metrics::counter;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use kube_lease::KubeLeaseStore;
pub use lease::{LeaseRecord, LeaseStore, MemoryLeaseClient, MemoryLeaseStore, VersionedLease};

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    /// Renew/retry cadence; strictly shorter than `lease_duration`.
    pub retry_period: Duration,
}

impl LeaderConfig {
    pub fn new(lease_name: impl Into<String>, namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self::with_duration(lease_name, namespace, identity, Duration::from_secs(15))
    }

    pub fn with_duration(
        lease_name: impl Into<String>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration,
            retry_period: lease_duration / 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Follower,
    Acquiring,
    Leader,
}

/// Published view of this process's leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leadership {
    pub state: LeaderState,
    /// Set only while `state == Leader`.
    pub fencing_token: Option<u64>,
}

impl Leadership {
    const FOLLOWER: Leadership = Leadership { state: LeaderState::Follower, fencing_token: None };
}

/// Become-leader / lose-leadership pair. Both run on the coordinator task;
/// `on_stopped_leading` runs after the handle already reports follower.
pub trait LeaderCallbacks: Send + Sync {
    fn on_started_leading(&self, fencing_token: u64);
    fn on_stopped_leading(&self);
}

/// Cheap, cloneable read side of the coordinator.
#[derive(Clone)]
pub struct LeaderHandle {
    current: Arc<ArcSwap<Leadership>>,
}

impl LeaderHandle {
    /// A handle that always reports leadership with `token`, for processes
    /// that run without election.
    pub fn always_leader(token: u64) -> Self {
        let l = Leadership { state: LeaderState::Leader, fencing_token: Some(token) };
        Self { current: Arc::new(ArcSwap::from_pointee(l)) }
    }

    pub fn current(&self) -> Leadership {
        **self.current.load()
    }

    pub fn is_leader(&self) -> bool {
        self.current().state == LeaderState::Leader
    }

    /// Fencing token to attach to a write, or `NotLeader`.
    pub fn fencing_token(&self) -> CorralResult<u64> {
        let l = self.current();
        match (l.state, l.fencing_token) {
            (LeaderState::Leader, Some(t)) => Ok(t),
            _ => Err(CorralError::NotLeader),
        }
    }
}

/// The lease we last saw and when we first saw it in that version.
struct Observed {
    lease: VersionedLease,
    at: Instant,
}

pub struct LeaderCoordinator {
    store: Arc<dyn LeaseStore>,
    cfg: LeaderConfig,
    current: Arc<ArcSwap<Leadership>>,
    callbacks: Vec<Arc<dyn LeaderCallbacks>>,
    observed: Option<Observed>,
}

impl LeaderCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>, cfg: LeaderConfig) -> Self {
        Self {
            store,
            cfg,
            current: Arc::new(ArcSwap::from_pointee(Leadership::FOLLOWER)),
            callbacks: Vec::new(),
            observed: None,
        }
    }

    pub fn on_change(&mut self, cb: Arc<dyn LeaderCallbacks>) {
        self.callbacks.push(cb);
    }

    pub fn handle(&self) -> LeaderHandle {
        LeaderHandle { current: Arc::clone(&self.current) }
    }

    /// Version of the lease last written or observed.
    pub fn observed_version(&self) -> Option<ResourceVersion> {
        self.observed.as_ref().map(|o| o.lease.version)
    }

    fn publish(&self, state: LeaderState, fencing_token: Option<u64>) {
        self.current.store(Arc::new(Leadership { state, fencing_token }));
    }

    fn promote(&self, token: u64) {
        self.publish(LeaderState::Leader, Some(token));
        counter!("leader_acquired_total", 1u64);
        info!(identity = %self.cfg.identity, lease = %self.cfg.lease_name, fencing_token = token, "became leader");
        for cb in &self.callbacks {
            cb.on_started_leading(token);
        }
    }

    fn demote(&self, reason: &str) {
        self.publish(LeaderState::Follower, None);
        counter!("leader_lost_total", 1u64);
        warn!(identity = %self.cfg.identity, lease = %self.cfg.lease_name, reason, "lost leadership");
        for cb in &self.callbacks {
            cb.on_stopped_leading();
        }
    }

    /// Campaign and hold the lease until `shutdown`; releases it on the way out.
    pub async fn run(mut self, shutdown: CancellationToken) -> CorralResult<()> {
        info!(identity = %self.cfg.identity, lease = %self.cfg.lease_name, ns = %self.cfg.namespace, "leader election started");
        loop {
            let leading = self.handle().is_leader();
            if !leading {
                self.publish(LeaderState::Acquiring, None);
            }
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = timeout(self.cfg.retry_period, self.try_acquire_or_renew(leading)) => r,
            };
            match (leading, attempt) {
                (false, Ok(Ok(Some(token)))) => self.promote(token),
                (false, Ok(Ok(None))) => self.publish(LeaderState::Follower, None),
                (false, Ok(Err(e))) => {
                    debug!(identity = %self.cfg.identity, error = %e, "acquire failed");
                    self.publish(LeaderState::Follower, None);
                }
                (false, Err(_)) => self.publish(LeaderState::Follower, None),
                (true, Ok(Ok(Some(_)))) => debug!(identity = %self.cfg.identity, "lease renewed"),
                (true, Ok(Ok(None))) => self.demote("lease taken by another holder"),
                (true, Ok(Err(e))) => self.demote(&e.to_string()),
                (true, Err(_)) => self.demote("renewal timed out"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.cfg.retry_period) => {}
            }
        }
        if self.handle().is_leader() {
            self.demote("shutting down");
            self.release().await;
        } else {
            self.publish(LeaderState::Follower, None);
        }
        Ok(())
    }

    /// One election round. `Some(token)` if we hold the lease afterwards.
    ///
    /// Only a renewal by the current leader keeps the token. Any acquisition
    /// starts a new term, even when the record still names us.
    async fn try_acquire_or_renew(&mut self, leading: bool) -> CorralResult<Option<u64>> {
        let now = Instant::now();
        let wall = Utc::now();
        let me = self.cfg.identity.clone();

        let Some(current) = self.store.get().await? else {
            let record = LeaseRecord {
                holder: Some(me),
                acquired_at: Some(wall),
                renewed_at: Some(wall),
                lease_duration: self.cfg.lease_duration,
                fencing_token: 1,
            };
            return match self.store.create(&record).await {
                Ok(version) => {
                    self.observed = Some(Observed { lease: VersionedLease { record, version }, at: now });
                    Ok(Some(1))
                }
                Err(CorralError::Conflict(_)) => Ok(None),
                Err(e) => Err(e),
            };
        };

        let changed = self.observed.as_ref().map_or(true, |o| o.lease.version != current.version);
        if changed {
            self.observed = Some(Observed { lease: current.clone(), at: now });
        }
        let seen_at = self.observed.as_ref().map_or(now, |o| o.at);

        let held_by_me = current.record.holder.as_deref() == Some(me.as_str());
        let expired = current.record.holder.is_none() || now >= seen_at + current.record.lease_duration;
        if !held_by_me && !expired {
            return Ok(None);
        }

        let record = if held_by_me && leading {
            LeaseRecord { renewed_at: Some(wall), lease_duration: self.cfg.lease_duration, ..current.record.clone() }
        } else {
            LeaseRecord {
                holder: Some(me),
                acquired_at: Some(wall),
                renewed_at: Some(wall),
                lease_duration: self.cfg.lease_duration,
                fencing_token: current.record.fencing_token + 1,
            }
        };
        match self.store.update(&record, current.version).await {
            Ok(version) => {
                let token = record.fencing_token;
                self.observed = Some(Observed { lease: VersionedLease { record, version }, at: now });
                Ok(Some(token))
            }
            Err(CorralError::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Best-effort hand-back so a peer need not wait out the TTL.
    async fn release(&mut self) {
        let Some(observed) = self.observed.take() else { return };
        if observed.lease.record.holder.as_deref() != Some(self.cfg.identity.as_str()) {
            return;
        }
        let record = LeaseRecord {
            holder: None,
            renewed_at: Some(Utc::now()),
            lease_duration: Duration::from_secs(1),
            ..observed.lease.record
        };
        match self.store.update(&record, observed.lease.version).await {
            Ok(_) => info!(identity = %self.cfg.identity, lease = %self.cfg.lease_name, "lease released"),
            Err(e) => warn!(identity = %self.cfg.identity, error = %e, "lease release failed"),
        }
    }
}
