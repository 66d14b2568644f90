//! Liveness watchdog
//!
//! Import progress is reported through a [`Heartbeat`]: a monotonic counter
//! bumped on every completed item and job, plus a gauge of runs currently in
//! progress. The [`Watchdog`] samples the counter once per window; if work is
//! in progress and the counter has not moved since the previous sample, it
//! cancels its `stalled` token. Whoever supervises the process decides what a
//! stall means (the `watch` command exits non-zero so a supervisor restarts it).

use reindex_common::events::{EventBus, ReindexEvent};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct HeartbeatInner {
    beats: AtomicU64,
    active: AtomicUsize,
}

/// Shared progress counter
#[derive(Clone, Default)]
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress
    pub fn beat(&self) {
        self.inner.beats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn beats(&self) -> u64 {
        self.inner.beats.load(Ordering::Relaxed)
    }

    /// Mark a run as in progress until the guard drops
    ///
    /// Starting a run counts as progress.
    pub fn activity(&self) -> ActivityGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        self.beat();
        ActivityGuard {
            heartbeat: self.clone(),
        }
    }

    pub fn active_runs(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

/// Decrements the in-progress gauge on drop
pub struct ActivityGuard {
    heartbeat: Heartbeat,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.heartbeat.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Watchdog {
    heartbeat: Heartbeat,
    window: Duration,
    stalled: CancellationToken,
    events: Option<EventBus>,
}

impl Watchdog {
    pub fn new(heartbeat: Heartbeat, window: Duration) -> Self {
        Self {
            heartbeat,
            window,
            stalled: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Token cancelled when a stall is detected
    pub fn stalled(&self) -> CancellationToken {
        self.stalled.clone()
    }

    /// Run until a stall is detected or `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.window);
        // First tick completes immediately
        interval.tick().await;
        let mut last_beats = self.heartbeat.beats();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let beats = self.heartbeat.beats();
                    let active = self.heartbeat.active_runs();

                    if active > 0 && beats == last_beats {
                        tracing::error!(
                            window_secs = self.window.as_secs(),
                            active_runs = active,
                            "No import progress within watchdog window, worker considered stalled"
                        );
                        if let Some(events) = &self.events {
                            events.emit_lossy(ReindexEvent::WorkerStalled {
                                idle_secs: self.window.as_secs(),
                                timestamp: chrono::Utc::now(),
                            });
                        }
                        self.stalled.cancel();
                        break;
                    }

                    tracing::trace!(beats, active_runs = active, "Watchdog check");
                    last_beats = beats;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_guard_tracks_runs() {
        let heartbeat = Heartbeat::new();
        {
            let _first = heartbeat.activity();
            let _second = heartbeat.activity();
            assert_eq!(heartbeat.active_runs(), 2);
        }
        assert_eq!(heartbeat.active_runs(), 0);
        assert_eq!(heartbeat.beats(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_never_stalls() {
        let heartbeat = Heartbeat::new();
        let watchdog = Watchdog::new(heartbeat.clone(), Duration::from_secs(120));
        let stalled = watchdog.stalled();
        let shutdown = CancellationToken::new();
        let handle = watchdog.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!stalled.is_cancelled());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_run_without_progress_stalls() {
        let heartbeat = Heartbeat::new();
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let watchdog = Watchdog::new(heartbeat.clone(), Duration::from_secs(120)).with_events(events);
        let stalled = watchdog.stalled();
        let handle = watchdog.spawn(CancellationToken::new());

        let _guard = heartbeat.activity();
        tokio::time::timeout(Duration::from_secs(400), stalled.cancelled())
            .await
            .expect("watchdog should report a stall");
        handle.await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), ReindexEvent::WorkerStalled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_keeps_watchdog_quiet() {
        let heartbeat = Heartbeat::new();
        let watchdog = Watchdog::new(heartbeat.clone(), Duration::from_secs(120));
        let stalled = watchdog.stalled();
        let shutdown = CancellationToken::new();
        let handle = watchdog.spawn(shutdown.clone());

        let _guard = heartbeat.activity();
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            heartbeat.beat();
        }
        assert!(!stalled.is_cancelled());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
