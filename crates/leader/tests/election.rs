#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use corral_core::{CorralError, ObjectKey};
use corral_kubehub::{MemoryCollection, RemoteWriter, WriteRequest};
use corral_leader::{LeaderCallbacks, LeaderConfig, LeaderCoordinator, LeaderHandle, MemoryLeaseStore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Timeline(Mutex<Vec<(String, bool, Instant)>>);

struct Recorder {
    name: String,
    timeline: Arc<Timeline>,
}

impl LeaderCallbacks for Recorder {
    fn on_started_leading(&self, _fencing_token: u64) {
        self.timeline.0.lock().unwrap().push((self.name.clone(), true, Instant::now()));
    }

    fn on_stopped_leading(&self) {
        self.timeline.0.lock().unwrap().push((self.name.clone(), false, Instant::now()));
    }
}

struct Candidate {
    handle: LeaderHandle,
    token: CancellationToken,
    task: JoinHandle<corral_core::CorralResult<()>>,
}

fn candidate(store: &MemoryLeaseStore, name: &str, timeline: &Arc<Timeline>) -> Candidate {
    let cfg = LeaderConfig::with_duration("corral", "default", name, Duration::from_secs(3));
    let mut c = LeaderCoordinator::new(Arc::new(store.client(name)), cfg);
    c.on_change(Arc::new(Recorder { name: name.to_string(), timeline: timeline.clone() }));
    let handle = c.handle();
    let token = CancellationToken::new();
    let task = tokio::spawn(c.run(token.clone()));
    Candidate { handle, token, task }
}

fn write(token: u64) -> WriteRequest {
    WriteRequest {
        key: ObjectKey::namespaced("Deployment", "default", "web"),
        body: serde_json::json!({ "metadata": { "name": "web", "namespace": "default" } }),
        expected_version: None,
        fencing_token: Some(token),
    }
}

#[tokio::test(start_paused = true)]
async fn holder_keeps_renewing() {
    let store = MemoryLeaseStore::new();
    let timeline = Arc::new(Timeline::default());
    let a = candidate(&store, "a", &timeline);
    sleep(Duration::from_millis(100)).await;
    let b = candidate(&store, "b", &timeline);

    for _ in 0..300 {
        sleep(Duration::from_millis(100)).await;
        assert!(a.handle.is_leader());
        assert!(!b.handle.is_leader());
    }
    assert_eq!(store.current().unwrap().fencing_token, 1);
    a.token.cancel();
    b.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn partitioned_leader_is_fenced_out() {
    let store = MemoryLeaseStore::new();
    let objects = MemoryCollection::new("Deployment");
    let timeline = Arc::new(Timeline::default());
    let a = candidate(&store, "a", &timeline);
    sleep(Duration::from_millis(100)).await;
    let b = candidate(&store, "b", &timeline);

    let a_token = a.handle.fencing_token().unwrap();
    assert_eq!(a_token, 1);
    objects.write(write(a_token)).await.unwrap();

    sleep(Duration::from_secs(2)).await;
    store.partition("a");

    let mut b_token = None;
    for _ in 0..300 {
        sleep(Duration::from_millis(100)).await;
        assert!(!(a.handle.is_leader() && b.handle.is_leader()), "two leaders at once");
        if let Ok(t) = b.handle.fencing_token() {
            b_token = Some(t);
            break;
        }
    }
    let b_token = b_token.expect("b never took over");
    assert_eq!(b_token, 2);
    objects.write(write(b_token)).await.unwrap();

    // the deposed leader's in-flight write still carries token 1
    assert_eq!(objects.write(write(a_token)).await, Err(CorralError::Fenced { presented: 1, current: 2 }));

    let events = timeline.0.lock().unwrap().clone();
    let a_stop = events.iter().find(|(n, started, _)| n == "a" && !started).map(|e| e.2).expect("a never stepped down");
    let b_start = events.iter().find(|(n, started, _)| n == "b" && *started).map(|e| e.2).unwrap();
    assert!(a_stop < b_start, "a stepped down at {:?}, b took over at {:?}", a_stop, b_start);

    store.heal("a");
    sleep(Duration::from_secs(5)).await;
    assert!(!a.handle.is_leader());
    assert!(b.handle.is_leader());
    a.token.cancel();
    b.token.cancel();
}

#[tokio::test(start_paused = true)]
async fn clean_shutdown_hands_over_without_waiting_for_ttl() {
    let store = MemoryLeaseStore::new();
    let timeline = Arc::new(Timeline::default());
    let a = candidate(&store, "a", &timeline);
    sleep(Duration::from_millis(100)).await;
    let b = candidate(&store, "b", &timeline);
    sleep(Duration::from_millis(500)).await;

    a.token.cancel();
    a.task.await.unwrap().unwrap();
    let released_at = Instant::now();
    assert!(store.current().unwrap().holder.is_none());

    while !b.handle.is_leader() {
        sleep(Duration::from_millis(50)).await;
    }
    // one retry period, well under the 3s ttl
    assert!(released_at.elapsed() <= Duration::from_millis(1100));
    assert_eq!(b.handle.fencing_token(), Ok(2));
    b.token.cancel();
    b.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn reacquiring_own_lease_starts_a_new_term() {
    let store = MemoryLeaseStore::new();
    let objects = MemoryCollection::new("Deployment");
    let timeline = Arc::new(Timeline::default());
    let a = candidate(&store, "a", &timeline);
    sleep(Duration::from_millis(100)).await;
    let first = a.handle.fencing_token().unwrap();
    assert_eq!(first, 1);

    store.partition("a");
    while a.handle.is_leader() {
        sleep(Duration::from_millis(100)).await;
    }
    // nobody else took the record, it still names us
    assert_eq!(store.current().unwrap().holder.as_deref(), Some("a"));

    store.heal("a");
    while !a.handle.is_leader() {
        sleep(Duration::from_millis(100)).await;
    }
    let second = a.handle.fencing_token().unwrap();
    assert!(second > first, "term {} did not advance past {}", second, first);
    assert_eq!(store.current().unwrap().fencing_token, second);

    objects.write(write(second)).await.unwrap();
    assert_eq!(
        objects.write(write(first)).await,
        Err(CorralError::Fenced { presented: first, current: second })
    );
    a.token.cancel();
    a.task.await.unwrap().unwrap();
}
