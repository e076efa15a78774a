//! Wiring of reflectors, dispatcher, controller and leader election into one
//! process with a single shutdown path.

use std::sync::Arc;
use std::time::Duration;

use corral_core::{ChangeEvent, CorralResult, ObjectKey};
use corral_kubehub::{ListWatcher, Reflector, ReflectorConfig};
use corral_leader::{LeaderCallbacks, LeaderCoordinator};
use corral_store::{delta_queue, dispatch::queue_cap_from_env, Dispatcher, EventHandler, IndexedStore};
use corral_workqueue::WorkQueue;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Controller;

/// On promotion, queue every cached key so work skipped while following is
/// picked up again.
pub struct ResyncOnLeadership {
    store: IndexedStore,
    queue: WorkQueue<ObjectKey>,
}

impl ResyncOnLeadership {
    pub fn new(store: IndexedStore, queue: WorkQueue<ObjectKey>) -> Self {
        Self { store, queue }
    }
}

impl LeaderCallbacks for ResyncOnLeadership {
    fn on_started_leading(&self, fencing_token: u64) {
        let records = self.store.list();
        info!(fencing_token, keys = records.len(), "leading; resyncing cached keys");
        for rec in records {
            self.queue.add(rec.key.clone());
        }
    }

    fn on_stopped_leading(&self) {}
}

pub struct Manager {
    store: IndexedStore,
    reflector_cfg: ReflectorConfig,
    queue_cap: usize,
    sources: Vec<Arc<dyn ListWatcher>>,
    dispatcher: Dispatcher,
    controller: Option<Controller>,
    leader: Option<LeaderCoordinator>,
    drain_grace: Duration,
}

/// How long the dispatcher may keep draining after the reflectors stop.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

impl Manager {
    pub fn new(store: IndexedStore) -> Self {
        Self {
            store,
            reflector_cfg: ReflectorConfig::from_env(),
            queue_cap: queue_cap_from_env(),
            sources: Vec::new(),
            dispatcher: Dispatcher::new(),
            controller: None,
            leader: None,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn store(&self) -> &IndexedStore {
        &self.store
    }

    pub fn with_reflector_config(mut self, cfg: ReflectorConfig) -> Self {
        self.reflector_cfg = cfg;
        self
    }

    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Mirror one kind into the store.
    pub fn watch(mut self, lw: Arc<dyn ListWatcher>) -> Self {
        self.sources.push(lw);
        self
    }

    pub fn observe(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.dispatcher.register(handler);
        self
    }

    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<ChangeEvent> {
        self.dispatcher.subscribe(capacity)
    }

    pub fn control(mut self, controller: Controller) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Gate reconciles on holding the lease. The controller's context should
    /// carry this coordinator's handle.
    pub fn elect(mut self, coordinator: LeaderCoordinator) -> Self {
        self.leader = Some(coordinator);
        self
    }

    /// Run until `shutdown`. Reflectors stop first, the dispatcher drains what
    /// they already queued for up to the drain grace, the controller finishes
    /// in-flight work, and the lease is released last.
    pub async fn run(mut self, shutdown: CancellationToken) -> CorralResult<()> {
        if let Some(c) = &self.controller {
            self.dispatcher.register(c.enqueue_handler());
            if let Some(leader) = self.leader.as_mut() {
                leader.on_change(Arc::new(ResyncOnLeadership::new(self.store.clone(), c.queue())));
            }
        }

        let (tx, rx) = delta_queue(self.queue_cap);
        let mut reflectors = Vec::with_capacity(self.sources.len());
        for lw in self.sources {
            let kind = lw.kind().to_string();
            let r = Reflector::new(lw, self.store.clone(), tx.clone(), self.reflector_cfg.clone());
            reflectors.push((kind, tokio::spawn(r.run(shutdown.clone()))));
        }
        drop(tx);
        // closes on its own once every reflector has dropped its sender
        let dispatch_token = CancellationToken::new();
        let mut dispatcher = self.dispatcher.spawn(rx, dispatch_token.clone());

        let leader_token = CancellationToken::new();
        let leader = self.leader.map(|c| tokio::spawn(c.run(leader_token.clone())));

        match self.controller {
            Some(c) => c.run(shutdown.clone()).await,
            None => shutdown.cancelled().await,
        }

        leader_token.cancel();
        if let Some(task) = leader {
            match task.await {
                Ok(Err(e)) => warn!(error = %e, "leader coordinator failed"),
                Err(e) => warn!(error = %e, "leader coordinator task aborted"),
                Ok(Ok(())) => {}
            }
        }

        let mut first_err = None;
        for (kind, task) in reflectors {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(kind = %kind, error = %e, "reflector exited with error");
                    first_err.get_or_insert(e);
                }
                Err(e) => warn!(kind = %kind, error = %e, "reflector task aborted"),
            }
        }
        let joined = match timeout(self.drain_grace, &mut dispatcher).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(grace = ?self.drain_grace, "delta queue not drained in time; abandoning it");
                dispatch_token.cancel();
                dispatcher.await
            }
        };
        match joined {
            Ok(stats) => info!(delivered = stats.delivered, handler_errors = stats.handler_errors, "manager stopped"),
            Err(e) => warn!(error = %e, "dispatcher task aborted"),
        }
        first_err.map_or(Ok(()), Err)
    }
}
