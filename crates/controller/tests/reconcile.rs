#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_controller::{Action, Controller, ControllerConfig, Manager, ReconcileContext, Reconciler};
use corral_core::{CorralError, CorralResult, ObjectKey, ObjectRecord};
use corral_kubehub::{MemoryCollection, ReflectorConfig, RemoteWriter};
use corral_leader::{LeaderConfig, LeaderCoordinator, LeaderHandle, MemoryLeaseStore};
use corral_store::IndexedStore;
use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn deployment(name: &str, replicas: u64) -> serde_json::Value {
    json!({
        "metadata": { "name": name, "namespace": "default" },
        "spec": { "replicas": replicas },
    })
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced("Deployment", "default", name)
}

fn labeled(rec: &ObjectRecord) -> bool {
    rec.raw.pointer("/metadata/labels/managed").is_some()
}

/// Adds `managed: "true"` to objects that lack it.
#[derive(Default)]
struct Labeler {
    calls: AtomicUsize,
}

#[async_trait]
impl Reconciler for Labeler {
    async fn reconcile(&self, ctx: &ReconcileContext, key: &ObjectKey) -> CorralResult<Action> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rec = ctx.get(key)?;
        if labeled(&rec) {
            return Ok(Action::Done);
        }
        let mut body = rec.raw.clone();
        body["metadata"]["labels"] = json!({ "managed": "true" });
        ctx.write(&rec, body).await?;
        Ok(Action::Done)
    }
}

fn controller(reconciler: Arc<dyn Reconciler>, store: &IndexedStore, writer: &Arc<MemoryCollection>, leader: LeaderHandle) -> Controller {
    let writer: Arc<dyn RemoteWriter> = writer.clone();
    let ctx = ReconcileContext::new(store.clone(), Some(writer), leader);
    Controller::new("labeler", reconciler, ctx, ControllerConfig::default())
}

#[tokio::test(start_paused = true)]
async fn key_deleted_before_dequeue_is_not_an_error() {
    let store = IndexedStore::default();
    let objects = Arc::new(MemoryCollection::new("Deployment"));
    let labeler = Arc::new(Labeler::default());
    let c = controller(labeler.clone(), &store, &objects, LeaderHandle::always_leader(1));
    let queue = c.queue();
    let token = CancellationToken::new();
    let task = tokio::spawn(c.run(token.clone()));

    queue.add(key("gone"));
    sleep(Duration::from_secs(1)).await;

    assert_eq!(labeler.calls.load(Ordering::SeqCst), 1);
    assert!(objects.writes().is_empty());
    assert_eq!(queue.num_requeues(&key("gone")), 0);
    assert!(queue.is_empty());
    token.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn conflict_is_retried_against_fresh_state() {
    let store = IndexedStore::default();
    let objects = Arc::new(MemoryCollection::new("Deployment"));
    let stale = objects.apply(deployment("web", 1)).unwrap();
    store.upsert(stale);
    // someone else scales it before we reconcile
    objects.apply(deployment("web", 3)).unwrap();

    let labeler = Arc::new(Labeler::default());
    let c = controller(labeler.clone(), &store, &objects, LeaderHandle::always_leader(1));
    let queue = c.queue();
    let token = CancellationToken::new();
    let task = tokio::spawn(c.run(token.clone()));
    queue.add(key("web"));

    while objects.writes().is_empty() {
        sleep(Duration::from_millis(1)).await;
    }
    assert!(objects.get(&key("web")).map_or(false, |r| !labeled(&r)));
    // the watch catches the cache up
    store.upsert(objects.get(&key("web")).unwrap());

    sleep(Duration::from_secs(1)).await;
    let writes = objects.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].expected_version.map(|v| v.0), Some(1));
    assert_eq!(writes[1].expected_version.map(|v| v.0), Some(2));
    assert!(writes.iter().all(|w| w.fencing_token == Some(1)));
    let live = objects.get(&key("web")).unwrap();
    assert!(labeled(&live));
    assert_eq!(live.raw["spec"]["replicas"], 3);
    assert_eq!(queue.num_requeues(&key("web")), 0);
    token.cancel();
    task.await.unwrap();
}

struct PanicsOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl Reconciler for PanicsOnce {
    async fn reconcile(&self, _ctx: &ReconcileContext, _key: &ObjectKey) -> CorralResult<Action> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("first reconcile blows up");
        }
        Ok(Action::Done)
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_reconcile_is_requeued_and_worker_survives() {
    let store = IndexedStore::default();
    let objects = Arc::new(MemoryCollection::new("Deployment"));
    let r = Arc::new(PanicsOnce { calls: AtomicUsize::new(0) });
    let cfg = ControllerConfig { workers: 1, ..ControllerConfig::default() };
    let writer: Arc<dyn RemoteWriter> = objects.clone();
    let ctx = ReconcileContext::new(store, Some(writer), LeaderHandle::always_leader(1));
    let c = Controller::new("panics", r.clone(), ctx, cfg);
    let queue = c.queue();
    let token = CancellationToken::new();
    let task = tokio::spawn(c.run(token.clone()));

    queue.add(key("a"));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(r.calls.load(Ordering::SeqCst), 2);

    queue.add(key("b"));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(r.calls.load(Ordering::SeqCst), 3);
    token.cancel();
    task.await.unwrap();
}

struct Periodic {
    calls: AtomicUsize,
}

#[async_trait]
impl Reconciler for Periodic {
    async fn reconcile(&self, _ctx: &ReconcileContext, _key: &ObjectKey) -> CorralResult<Action> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Action::RequeueAfter(Duration::from_secs(10)))
    }
}

#[tokio::test(start_paused = true)]
async fn requeue_after_waits_for_the_delay() {
    let r = Arc::new(Periodic { calls: AtomicUsize::new(0) });
    let ctx = ReconcileContext::new(IndexedStore::default(), None, LeaderHandle::always_leader(1));
    let c = Controller::new("periodic", r.clone(), ctx, ControllerConfig::default());
    let queue = c.queue();
    let token = CancellationToken::new();
    let task = tokio::spawn(c.run(token.clone()));

    queue.add(key("tick"));
    sleep(Duration::from_secs(5)).await;
    assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    sleep(Duration::from_secs(6)).await;
    assert_eq!(r.calls.load(Ordering::SeqCst), 2);
    assert_eq!(queue.num_requeues(&key("tick")), 0);
    token.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn follower_neither_reconciles_nor_writes() {
    let store = IndexedStore::default();
    let objects = Arc::new(MemoryCollection::new("Deployment"));
    let rec = objects.apply(deployment("web", 1)).unwrap();
    store.upsert(rec.clone());

    let lease = MemoryLeaseStore::new();
    let follower = LeaderCoordinator::new(Arc::new(lease.client("me")), LeaderConfig::new("corral", "default", "me")).handle();

    let writer: Arc<dyn RemoteWriter> = objects.clone();
    let ctx = ReconcileContext::new(store.clone(), Some(writer), follower.clone());
    assert_eq!(ctx.write(&rec, deployment("web", 2)).await, Err(CorralError::NotLeader));

    let labeler = Arc::new(Labeler::default());
    let c = controller(labeler.clone(), &store, &objects, follower);
    let queue = c.queue();
    let token = CancellationToken::new();
    let task = tokio::spawn(c.run(token.clone()));
    queue.add(key("web"));
    sleep(Duration::from_secs(1)).await;

    assert_eq!(labeler.calls.load(Ordering::SeqCst), 0);
    assert!(objects.writes().is_empty());
    token.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn manager_mirrors_and_reconciles_under_a_lease() {
    let objects = Arc::new(MemoryCollection::new("Deployment"));
    for name in ["api", "web", "worker"] {
        objects.apply(deployment(name, 2)).unwrap();
    }
    let store = IndexedStore::default();
    let lease = MemoryLeaseStore::new();
    let coordinator = LeaderCoordinator::new(
        Arc::new(lease.client("pod-a")),
        LeaderConfig::with_duration("corral", "default", "pod-a", Duration::from_secs(3)),
    );
    let leader = coordinator.handle();
    let labeler = Arc::new(Labeler::default());
    let c = controller(labeler.clone(), &store, &objects, leader.clone());

    let manager = Manager::new(store.clone())
        .with_reflector_config(ReflectorConfig::default())
        .with_queue_cap(64)
        .watch(objects.clone())
        .control(c)
        .elect(coordinator);
    let token = CancellationToken::new();
    let task = tokio::spawn(manager.run(token.clone()));

    sleep(Duration::from_secs(5)).await;
    assert!(leader.is_leader());
    assert!(store.has_synced());
    for name in ["api", "web", "worker"] {
        assert!(labeled(&objects.get(&key(name)).unwrap()), "{} not reconciled", name);
        // the cache saw our own write come back through the watch
        assert!(labeled(&store.get(&key(name)).unwrap()));
    }
    assert!(objects.writes().iter().all(|w| w.fencing_token == Some(1)));

    objects.apply(deployment("batch", 1)).unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(labeled(&objects.get(&key("batch")).unwrap()));

    token.cancel();
    task.await.unwrap().unwrap();
    assert!(!leader.is_leader());
    assert_eq!(lease.current().unwrap().holder, None);
}

#[tokio::test(start_paused = true)]
async fn unread_subscriber_does_not_block_shutdown() {
    let objects = Arc::new(MemoryCollection::new("Deployment"));
    for name in ["a", "b", "c", "d", "e"] {
        objects.apply(deployment(name, 1)).unwrap();
    }
    let store = IndexedStore::default();
    let mut manager = Manager::new(store.clone())
        .with_reflector_config(ReflectorConfig::default())
        .with_queue_cap(8)
        .with_drain_grace(Duration::from_secs(2))
        .watch(objects.clone());
    let _events = manager.subscribe(1);
    let token = CancellationToken::new();
    let task = tokio::spawn(manager.run(token.clone()));

    sleep(Duration::from_secs(1)).await;
    assert!(store.has_synced());
    token.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(10), task).await;
    assert!(matches!(stopped, Ok(Ok(Ok(())))), "manager did not stop: {:?}", stopped.is_ok());
}
