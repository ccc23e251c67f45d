//! Background eviction of expired window entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::store::WindowStore;

/// Shortest interval the sweeper runs at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the periodic sweep task.
///
/// The task stops when [`Sweeper::shutdown`] is awaited. Dropping the handle
/// without shutting down aborts the task, so it never outlives its owner.
#[derive(Debug)]
pub struct Sweeper {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn a task that sweeps `store` every `interval`, starting one interval from now.
    ///
    /// Intervals shorter than one second are raised to one second. Must be
    /// called from within a tokio runtime.
    pub fn spawn(store: Arc<WindowStore>, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "Sweep interval too short, using {}s",
                MIN_INTERVAL.as_secs()
            );
        }
        let interval = interval.max(MIN_INTERVAL);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = interval.as_secs(), "Window sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        debug!(removed, tracked = store.len(), "Sweep finished");
                    }
                    _ = &mut stop_rx => {
                        break;
                    }
                }
            }

            info!("Window sweeper stopped");
        });

        Self {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Window sweeper did not stop cleanly");
            }
        }
    }

    /// Whether the sweep task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);
    const SWEEP: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_keys() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(WindowStore::new(clock.clone()));
        let sweeper = Sweeper::spawn(store.clone(), SWEEP);

        store.record_and_count("idle", MINUTE).unwrap();
        clock.advance(Duration::from_secs(61));

        // Before the first tick nothing is removed.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.len(), 1);

        tokio::time::sleep(SWEEP).await;
        assert!(store.is_empty());

        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_task() {
        let store = Arc::new(WindowStore::new(Arc::new(ManualClock::new())));
        let sweeper = Sweeper::spawn(store, SWEEP);

        assert!(sweeper.is_running());
        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_keeps_sweeping() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(WindowStore::new(clock.clone()));
        let sweeper = Sweeper::spawn(store.clone(), Duration::ZERO);

        store.record_and_count("idle", MINUTE).unwrap();
        clock.advance(Duration::from_secs(61));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sweeper.is_running());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(sweeper.is_running());
        assert!(store.is_empty());

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_aborts_task() {
        let store = Arc::new(WindowStore::new(Arc::new(ManualClock::new())));
        let sweeper = Sweeper::spawn(store.clone(), SWEEP);
        drop(sweeper);

        tokio::task::yield_now().await;
        // The task held the only other reference to the store.
        for _ in 0..100 {
            if Arc::strong_count(&store) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&store), 1);
    }
}
