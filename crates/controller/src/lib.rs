//! Corral controller: reconcile workers fed by the work queue.

#![forbid(unsafe_code)]

mod manager;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use corral_core::{ChangeEvent, CorralError, CorralResult, ObjectKey, ObjectRecord, ResourceVersion};
use corral_kubehub::{RemoteWriter, WriteRequest};
use corral_leader::LeaderHandle;
use corral_store::{EventHandler, IndexedStore};
use corral_workqueue::{RateLimiterConfig, WorkQueue};
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use manager::{Manager, ResyncOnLeadership};

/// What to do with a key after reconciling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    /// Retry with the key's rate-limited backoff.
    Requeue,
    RequeueAfter(Duration),
}

/// User-supplied reconcile logic. Errors are never fatal to the worker:
/// `NotFound` counts as success, everything else is retried with backoff.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, ctx: &ReconcileContext, key: &ObjectKey) -> CorralResult<Action>;
}

/// Read access to the cache and fenced write access to the remote side.
#[derive(Clone)]
pub struct ReconcileContext {
    store: IndexedStore,
    writer: Option<Arc<dyn RemoteWriter>>,
    leader: LeaderHandle,
}

impl ReconcileContext {
    pub fn new(store: IndexedStore, writer: Option<Arc<dyn RemoteWriter>>, leader: LeaderHandle) -> Self {
        Self { store, writer, leader }
    }

    pub fn store(&self) -> &IndexedStore {
        &self.store
    }

    pub fn leader(&self) -> &LeaderHandle {
        &self.leader
    }

    /// Current cached state of `key`, or `NotFound`.
    pub fn get(&self, key: &ObjectKey) -> CorralResult<Arc<ObjectRecord>> {
        self.store.get(key).ok_or_else(|| CorralError::NotFound(key.to_string()))
    }

    /// Write `body` over `observed`, failing with `Conflict` if the remote
    /// object moved past `observed` and with `NotLeader` if we lost the lease.
    /// The store is not touched; the result comes back through the watch.
    pub async fn write(&self, observed: &ObjectRecord, body: serde_json::Value) -> CorralResult<ResourceVersion> {
        let token = self.leader.fencing_token()?;
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| CorralError::Configuration("controller has no remote writer".into()))?;
        let req = WriteRequest {
            key: observed.key.clone(),
            body,
            expected_version: Some(observed.resource_version),
            fencing_token: Some(token),
        };
        writer.write(req).await
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    /// How long in-flight reconciles may run after shutdown.
    pub shutdown_grace: Duration,
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 2, shutdown_grace: Duration::from_secs(30), rate_limiter: RateLimiterConfig::default() }
    }
}

/// Observer that turns change events into queued keys.
pub struct EnqueueHandler {
    queue: WorkQueue<ObjectKey>,
}

#[async_trait]
impl EventHandler for EnqueueHandler {
    fn name(&self) -> &str {
        "enqueue"
    }

    async fn handle(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        self.queue.add(event.key().clone());
        Ok(())
    }
}

pub struct Controller {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    ctx: ReconcileContext,
    queue: WorkQueue<ObjectKey>,
    cfg: ControllerConfig,
}

impl Controller {
    pub fn new(name: impl Into<String>, reconciler: Arc<dyn Reconciler>, ctx: ReconcileContext, cfg: ControllerConfig) -> Self {
        let queue = WorkQueue::new(cfg.rate_limiter);
        Self { name: name.into(), reconciler, ctx, queue, cfg }
    }

    pub fn queue(&self) -> WorkQueue<ObjectKey> {
        self.queue.clone()
    }

    pub fn context(&self) -> &ReconcileContext {
        &self.ctx
    }

    pub fn enqueue_handler(&self) -> Arc<dyn EventHandler> {
        Arc::new(EnqueueHandler { queue: self.queue.clone() })
    }

    /// Run workers until `shutdown`, then stop the queue and give in-flight
    /// reconciles up to the grace period.
    pub async fn run(self, shutdown: CancellationToken) {
        let workers = self.cfg.workers.max(1);
        info!(controller = %self.name, workers, "controller started");
        let mut tasks = Vec::with_capacity(workers);
        for id in 0..workers {
            let w = Worker {
                id,
                controller: self.name.clone(),
                reconciler: Arc::clone(&self.reconciler),
                ctx: self.ctx.clone(),
                queue: self.queue.clone(),
            };
            tasks.push(tokio::spawn(w.run()));
        }
        shutdown.cancelled().await;
        let drained = self.queue.shut_down_with_drain(self.cfg.shutdown_grace).await;
        if !drained {
            warn!(controller = %self.name, grace_secs = self.cfg.shutdown_grace.as_secs(), "in-flight reconciles outlived grace period");
            for t in &tasks {
                t.abort();
            }
        }
        for t in tasks {
            let _ = t.await;
        }
        info!(controller = %self.name, "controller stopped");
    }
}

struct Worker {
    id: usize,
    controller: String,
    reconciler: Arc<dyn Reconciler>,
    ctx: ReconcileContext,
    queue: WorkQueue<ObjectKey>,
}

impl Worker {
    async fn run(self) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(controller = %self.controller, worker = self.id, "worker exiting");
    }

    async fn process(&self, key: &ObjectKey) {
        if !self.ctx.leader.is_leader() {
            // picked up again by the leadership resync
            debug!(key = %key, "not leading; skipping");
            return;
        }
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&self.ctx, key)).catch_unwind().await;
        counter!("reconcile_total", 1u64);
        histogram!("reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(Ok(Action::Done)) => {
                debug!(key = %key, "reconcile ok");
                self.queue.forget(key);
            }
            Ok(Ok(Action::Requeue)) => {
                debug!(key = %key, "reconcile asked for requeue");
                self.queue.add_rate_limited(key.clone());
            }
            Ok(Ok(Action::RequeueAfter(d))) => {
                debug!(key = %key, after_ms = d.as_millis() as u64, "reconcile scheduled requeue");
                self.queue.forget(key);
                self.queue.add_after(key.clone(), d);
            }
            Ok(Err(e)) if e.is_not_found() => {
                debug!(key = %key, "object gone; nothing to reconcile");
                self.queue.forget(key);
            }
            Ok(Err(CorralError::NotLeader)) => {
                info!(key = %key, "lost leadership during reconcile");
                self.queue.forget(key);
            }
            Ok(Err(e)) => {
                counter!("reconcile_errors_total", 1u64);
                let retries = self.queue.num_requeues(key);
                match &e {
                    CorralError::Conflict(_) => info!(key = %key, retries, error = %e, "reconcile conflict; requeueing"),
                    _ => warn!(key = %key, retries, error = %e, "reconcile failed; requeueing"),
                }
                self.queue.add_rate_limited(key.clone());
            }
            Err(panic) => {
                counter!("reconcile_errors_total", 1u64);
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(key = %key, panic = %msg, "reconcile panicked; requeueing");
                self.queue.add_rate_limited(key.clone());
            }
        }
    }
}
