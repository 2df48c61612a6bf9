//! Per-listener drain control with in-flight tracking.
//!
//! Every bound listener owns a [`DrainController`]. Unbinding a listener
//! flips it to `Draining`, signals the accept loop, then waits for the
//! in-flight guards held by request handlers and stream tasks to drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle of one listener.
///
/// State machine: Binding -> Serving -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Port claimed, accept loop not yet running.
    Binding,
    /// Accepting connections.
    Serving,
    /// No new work accepted; waiting for in-flight work.
    Draining,
    /// All in-flight work finished.
    Stopped,
}

impl ListenerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binding => "binding",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates the unbind of a single listener.
#[derive(Debug)]
pub struct DrainController {
    drain_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<ListenerState>,
}

impl DrainController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            drain_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(ListenerState::Binding),
        }
    }

    pub fn set_serving(&self) {
        self.state.store(Arc::new(ListenerState::Serving));
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        **self.state.load()
    }

    /// Whether new connections or requests should still be admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        matches!(self.state(), ListenerState::Binding | ListenerState::Serving)
    }

    /// Receiver that flips to `true` once draining starts.
    #[must_use]
    pub fn drain_receiver(&self) -> watch::Receiver<bool> {
        self.drain_signal.subscribe()
    }

    /// Future resolving once draining starts. Suitable for
    /// `axum::serve(..).with_graceful_shutdown(..)`.
    pub fn drained(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.drain_receiver();
        async move {
            // A dropped sender also ends the wait.
            let _ = rx.wait_for(|draining| *draining).await;
        }
    }

    /// Moves to `Draining` and wakes every drain receiver.
    pub fn trigger_drain(&self) {
        self.state.store(Arc::new(ListenerState::Draining));
        let _ = self.drain_signal.send(true);
    }

    /// RAII guard counting one unit of in-flight work.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for in-flight work to finish.
    ///
    /// Returns `true` and moves to `Stopped` when the count reached zero.
    /// On timeout the state stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(ListenerState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped, panics included.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_states() {
        let drain = DrainController::new();
        assert_eq!(drain.state(), ListenerState::Binding);
        assert!(drain.is_accepting());

        drain.set_serving();
        assert_eq!(drain.state(), ListenerState::Serving);
        assert!(drain.is_accepting());

        drain.trigger_drain();
        assert_eq!(drain.state(), ListenerState::Draining);
        assert!(!drain.is_accepting());
        assert_eq!(drain.state().as_str(), "draining");
    }

    #[test]
    fn in_flight_guard_counts() {
        let drain = DrainController::new();
        let first = drain.in_flight_guard();
        let second = drain.in_flight_guard();
        assert_eq!(drain.in_flight_count(), 2);
        drop(first);
        assert_eq!(drain.in_flight_count(), 1);
        drop(second);
        assert_eq!(drain.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drained_future_resolves_on_trigger() {
        let drain = DrainController::new();
        let wait = tokio::spawn(drain.drained());
        tokio::task::yield_now().await;
        assert!(!wait.is_finished());

        drain.trigger_drain();
        tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn drained_future_resolves_if_already_triggered() {
        let drain = DrainController::new();
        drain.trigger_drain();
        tokio::time::timeout(Duration::from_secs(1), drain.drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_after_guard_released() {
        let drain = Arc::new(DrainController::new());
        drain.set_serving();
        let guard = drain.in_flight_guard();
        drain.trigger_drain();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(drain.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(drain.state(), ListenerState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_times_out() {
        let drain = DrainController::new();
        let _guard = drain.in_flight_guard();
        drain.trigger_drain();

        assert!(!drain.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(drain.state(), ListenerState::Draining);
    }
}
