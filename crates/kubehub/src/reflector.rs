//! List-then-watch driver that keeps an [`IndexedStore`] in sync with one
//! remote collection and forwards normalized events to the delta queue.

use std::sync::Arc;
use std::time::Duration;

use corral_core::backoff::{ExponentialBackoff, Jitter};
use corral_core::{ChangeEvent, CorralError, CorralResult, ResourceVersion};
use corral_store::{DeltaSender, IndexedStore};
use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{ListWatcher, WatchEvent, WatchStream};

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Full relist cadence, independent of watch health.
    pub relist_period: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Server-side lifetime of one watch request.
    pub watch_timeout: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            relist_period: Duration::from_secs(600),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            watch_timeout: Duration::from_secs(290),
        }
    }
}

impl ReflectorConfig {
    /// Defaults overridden by `CORRAL_RELIST_SECS` and `CORRAL_WATCH_BACKOFF_MAX_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let relist_secs = std::env::var("CORRAL_RELIST_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(d.relist_period.as_secs());
        let backoff_max = std::env::var("CORRAL_WATCH_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .unwrap_or(d.backoff_cap.as_secs());
        Self {
            // never shorter than one watch lifetime
            relist_period: Duration::from_secs(relist_secs).max(d.watch_timeout),
            backoff_cap: Duration::from_secs(backoff_max),
            ..d
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorState {
    Idle,
    Listing,
    Watching,
    Relisting,
    Stopped,
}

/// Why a watch session ended.
enum WatchEnd {
    Shutdown,
    /// Cursor rejected or periodic resync due.
    Relist,
    /// Stream closed or failed; resume from the cursor after backoff.
    Retry,
}

pub struct Reflector {
    lw: Arc<dyn ListWatcher>,
    store: IndexedStore,
    out: DeltaSender,
    cfg: ReflectorConfig,
    state: watch::Sender<ReflectorState>,
}

impl Reflector {
    pub fn new(lw: Arc<dyn ListWatcher>, store: IndexedStore, out: DeltaSender, cfg: ReflectorConfig) -> Self {
        let (state, _) = watch::channel(ReflectorState::Idle);
        Self { lw, store, out, cfg, state }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ReflectorState> {
        self.state.subscribe()
    }

    fn set_state(&self, s: ReflectorState) {
        let prev = self.state.send_replace(s);
        if prev != s {
            info!(kind = %self.lw.kind(), from = ?prev, to = ?s, "reflector state");
        }
    }

    /// Run until `shutdown` fires. Transport failures are retried here and
    /// never returned.
    pub async fn run(self, shutdown: CancellationToken) -> CorralResult<()> {
        let mut backoff = ExponentialBackoff::new(self.cfg.backoff_base, self.cfg.backoff_cap, Jitter::Full);
        let mut cursor: Option<ResourceVersion> = None;
        let mut relist_at = Instant::now() + self.cfg.relist_period;
        let mut listed_once = false;

        'outer: loop {
            let since = match cursor {
                Some(rv) => rv,
                None => {
                    self.set_state(if listed_once { ReflectorState::Relisting } else { ReflectorState::Listing });
                    let listed = tokio::select! {
                        _ = shutdown.cancelled() => break 'outer,
                        r = self.list_and_replace(&shutdown) => r,
                    };
                    match listed {
                        Ok(Some(rv)) => {
                            listed_once = true;
                            backoff.reset();
                            relist_at = Instant::now() + self.cfg.relist_period;
                            cursor = Some(rv);
                            rv
                        }
                        Ok(None) => break 'outer,
                        Err(e) => {
                            let delay = backoff.next_delay();
                            warn!(kind = %self.lw.kind(), error = %e, delay_ms = delay.as_millis() as u64, "list failed");
                            if !pause(delay, &shutdown).await {
                                break 'outer;
                            }
                            continue;
                        }
                    }
                }
            };

            self.set_state(ReflectorState::Watching);
            let opened = tokio::select! {
                _ = shutdown.cancelled() => break 'outer,
                r = self.lw.watch(since) => r,
            };
            let end = match opened {
                Ok(stream) => self.consume(stream, &mut cursor, &mut backoff, relist_at, &shutdown).await,
                Err(CorralError::ResourceExpired(msg)) => {
                    info!(kind = %self.lw.kind(), cursor = %since, reason = %msg, "watch cursor expired");
                    WatchEnd::Relist
                }
                Err(e) => {
                    warn!(kind = %self.lw.kind(), cursor = %since, error = %e, "watch failed to open");
                    WatchEnd::Retry
                }
            };
            match end {
                WatchEnd::Shutdown => break 'outer,
                WatchEnd::Relist => {
                    counter!("reflector_relist_total", 1u64);
                    cursor = None;
                }
                WatchEnd::Retry => {
                    counter!("reflector_watch_restarts_total", 1u64);
                    let delay = backoff.next_delay();
                    debug!(kind = %self.lw.kind(), delay_ms = delay.as_millis() as u64, "rewatching after backoff");
                    if !pause(delay, &shutdown).await {
                        break 'outer;
                    }
                }
            }
        }

        self.set_state(ReflectorState::Stopped);
        Ok(())
    }

    /// List, replace the store's view of this kind and forward the diff.
    /// `Ok(None)` means shutdown interrupted forwarding.
    async fn list_and_replace(&self, shutdown: &CancellationToken) -> CorralResult<Option<ResourceVersion>> {
        let started = Instant::now();
        let listing = self.lw.list().await?;
        counter!("reflector_list_total", 1u64);
        histogram!("reflector_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        let count = listing.items.len();
        let events = self.store.replace(self.lw.kind(), listing.items);
        self.store.mark_synced();
        info!(kind = %self.lw.kind(), objects = count, changes = events.len(), rv = %listing.resource_version, "listed");
        for ev in events {
            if !self.forward(ev, shutdown).await {
                return Ok(None);
            }
        }
        Ok(Some(listing.resource_version))
    }

    async fn consume(
        &self,
        mut stream: WatchStream,
        cursor: &mut Option<ResourceVersion>,
        backoff: &mut ExponentialBackoff,
        relist_at: Instant,
        shutdown: &CancellationToken,
    ) -> WatchEnd {
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return WatchEnd::Shutdown,
                _ = sleep_until(relist_at) => {
                    info!(kind = %self.lw.kind(), "periodic relist");
                    return WatchEnd::Relist;
                }
                item = stream.next() => item,
            };
            match item {
                None => {
                    debug!(kind = %self.lw.kind(), "watch stream closed");
                    return WatchEnd::Retry;
                }
                Some(Ok(ev)) => {
                    backoff.reset();
                    *cursor = Some(ev.resource_version());
                    if let Some(change) = self.apply(ev) {
                        if !self.forward(change, shutdown).await {
                            return WatchEnd::Shutdown;
                        }
                    }
                }
                Some(Err(CorralError::ResourceExpired(msg))) => {
                    info!(kind = %self.lw.kind(), reason = %msg, "watch expired");
                    return WatchEnd::Relist;
                }
                Some(Err(e)) => {
                    warn!(kind = %self.lw.kind(), error = %e, "watch broke");
                    return WatchEnd::Retry;
                }
            }
        }
    }

    /// Apply one watch event to the store; `None` if it changed nothing.
    fn apply(&self, ev: WatchEvent) -> Option<ChangeEvent> {
        let (key, rv) = match &ev {
            WatchEvent::Bookmark(_) => return None,
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => (r.key.clone(), r.resource_version),
        };
        let change = match ev {
            WatchEvent::Added(r) | WatchEvent::Modified(r) => self.store.upsert(r),
            WatchEvent::Deleted(r) => self.store.remove_observed(r),
            WatchEvent::Bookmark(_) => None,
        };
        if change.is_none() {
            counter!("reflector_stale_dropped_total", 1u64);
            debug!(key = %key, rv = %rv, "watch event superseded");
        }
        change
    }

    async fn forward(&self, ev: ChangeEvent, shutdown: &CancellationToken) -> bool {
        counter!("reflector_events_total", 1u64);
        debug!(key = %ev.key(), verb = ev.verb(), rv = %ev.record().resource_version, "forward");
        tokio::select! {
            _ = shutdown.cancelled() => false,
            sent = self.out.send(ev) => {
                if !sent {
                    // store stays authoritative without observers
                    debug!(kind = %self.lw.kind(), "delta queue closed");
                }
                true
            }
        }
    }
}

/// Sleep unless shut down first. Returns `false` on shutdown.
async fn pause(d: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(d) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relist_period_never_below_watch_timeout() {
        std::env::set_var("CORRAL_RELIST_SECS", "5");
        let cfg = ReflectorConfig::from_env();
        std::env::remove_var("CORRAL_RELIST_SECS");
        assert_eq!(cfg.relist_period, Duration::from_secs(290));
        assert_eq!(cfg.backoff_base, Duration::from_secs(1));
    }
}
