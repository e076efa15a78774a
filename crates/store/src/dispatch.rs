//! Delta queue and dispatcher.
//!
//! The reflector pushes normalized events into a bounded queue; a single
//! dispatcher task drains it and calls observers in registration order. A
//! full queue blocks the producer, so observers never miss events.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::ChangeEvent;
use futures::FutureExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default delta queue capacity (`CORRAL_QUEUE_CAP`).
pub const DEFAULT_QUEUE_CAP: usize = 2048;

pub fn queue_cap_from_env() -> usize {
    std::env::var("CORRAL_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_QUEUE_CAP)
}

/// Producer half of the delta queue.
#[derive(Clone)]
pub struct DeltaSender {
    tx: mpsc::Sender<ChangeEvent>,
}

impl DeltaSender {
    /// Enqueue, waiting for room. Returns `false` once the dispatcher is gone.
    pub async fn send(&self, event: ChangeEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the delta queue; owned by the [`Dispatcher`].
pub struct DeltaReceiver {
    rx: mpsc::Receiver<ChangeEvent>,
}

impl DeltaReceiver {
    /// Pull directly, bypassing a [`Dispatcher`].
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

pub fn delta_queue(capacity: usize) -> (DeltaSender, DeltaReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DeltaSender { tx }, DeltaReceiver { rx })
}

/// Observer of change events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Label used in logs when the handler fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, event: &ChangeEvent) -> anyhow::Result<()>;
}

/// Totals reported when the dispatcher exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub handler_errors: u64,
}

/// Fans events out to handlers and channel subscribers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
    subscribers: Vec<mpsc::Sender<ChangeEvent>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Channel-style observer. A subscriber whose receiver is dropped is pruned.
    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    pub fn spawn(self, rx: DeltaReceiver, shutdown: CancellationToken) -> JoinHandle<DispatchStats> {
        tokio::spawn(self.run(rx, shutdown))
    }

    /// Drain the queue until every producer is dropped, or stop early (and
    /// abandon whatever is still queued) when `shutdown` fires. A send to a
    /// full subscriber waits, but never past `shutdown`.
    pub async fn run(mut self, mut rx: DeltaReceiver, shutdown: CancellationToken) -> DispatchStats {
        let mut stats = DispatchStats::default();
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(delivered = stats.delivered, "dispatcher stopping");
                    break;
                }
                ev = rx.rx.recv() => match ev {
                    Some(ev) => ev,
                    None => {
                        debug!(delivered = stats.delivered, "delta queue closed");
                        break;
                    }
                },
            };
            match self.deliver(&event, &shutdown).await {
                Some(errors) => stats.handler_errors += errors,
                None => {
                    info!(delivered = stats.delivered, "dispatcher stopping with a subscriber still full");
                    break;
                }
            }
            stats.delivered += 1;
        }
        stats
    }

    /// Handler error count, or `None` if `shutdown` fired while a
    /// subscriber was full.
    async fn deliver(&mut self, event: &ChangeEvent, shutdown: &CancellationToken) -> Option<u64> {
        let mut errors = 0;
        for h in &self.handlers {
            let outcome = AssertUnwindSafe(h.handle(event)).catch_unwind().await;
            let err = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            errors += 1;
            counter!("dispatch_handler_errors_total", 1u64);
            warn!(handler = h.name(), key = %event.key(), verb = event.verb(), error = %err, "event handler failed");
        }
        let mut i = 0;
        while i < self.subscribers.len() {
            let sent = tokio::select! {
                _ = shutdown.cancelled() => return None,
                r = self.subscribers[i].send(event.clone()) => r,
            };
            if sent.is_err() {
                debug!("pruning closed subscriber");
                self.subscribers.swap_remove(i);
            } else {
                i += 1;
            }
        }
        Some(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{ObjectKey, ObjectRecord, ResourceVersion};
    use std::sync::Mutex;

    fn added(name: &str) -> ChangeEvent {
        ChangeEvent::Added(Arc::new(ObjectRecord {
            key: ObjectKey::namespaced("Pod", "default", name),
            resource_version: ResourceVersion(1),
            creation_ts: None,
            deletion_ts: None,
            deleted: false,
            raw: serde_json::Value::Null,
        }))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &ChangeEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.key().name.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, event: &ChangeEvent) -> anyhow::Result<()> {
            if event.key().name == "boom" {
                panic!("boom");
            }
            anyhow::bail!("nope")
        }
    }

    #[tokio::test]
    async fn delivers_in_order_and_survives_failing_handler() {
        let rec = Arc::new(Recorder::default());
        let mut d = Dispatcher::new();
        d.register(Arc::new(Failing));
        d.register(rec.clone());
        let (tx, rx) = delta_queue(2);
        let handle = d.spawn(rx, CancellationToken::new());
        for n in ["a", "boom", "b", "c"] {
            assert!(tx.send(added(n)).await);
        }
        drop(tx);
        let stats = handle.await.unwrap();
        assert_eq!(stats, DispatchStats { delivered: 4, handler_errors: 4 });
        assert_eq!(*rec.0.lock().unwrap(), vec!["a", "boom", "b", "c"]);
    }

    #[tokio::test]
    async fn subscribers_receive_and_closed_ones_are_pruned() {
        let mut d = Dispatcher::new();
        let mut keep = d.subscribe(8);
        let gone = d.subscribe(8);
        drop(gone);
        let (tx, rx) = delta_queue(8);
        let handle = d.spawn(rx, CancellationToken::new());
        tx.send(added("x")).await;
        tx.send(added("y")).await;
        drop(tx);
        handle.await.unwrap();
        assert_eq!(keep.recv().await.unwrap().key().name, "x");
        assert_eq!(keep.recv().await.unwrap().key().name, "y");
    }

    #[tokio::test(start_paused = true)]
    async fn full_subscriber_does_not_outlive_shutdown() {
        let mut d = Dispatcher::new();
        let _stuck = d.subscribe(1);
        let (tx, rx) = delta_queue(8);
        let token = CancellationToken::new();
        let handle = d.spawn(rx, token.clone());
        for n in ["a", "b", "c"] {
            assert!(tx.send(added(n)).await);
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(!handle.is_finished());

        token.cancel();
        let stats = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let d = Dispatcher::new();
        let (tx, rx) = delta_queue(8);
        let token = CancellationToken::new();
        let handle = d.spawn(rx, token.clone());
        token.cancel();
        handle.await.unwrap();
        assert!(!tx.send(added("late")).await);
    }
}
