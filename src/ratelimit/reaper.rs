//! Periodic eviction of idle window entries.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::window::WindowStore;

/// Reaper schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Entries idle for longer than this are evicted
    pub max_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(15 * 60),
        }
    }
}

/// Remove every entry whose last request is strictly older than `max_age`.
///
/// Returns the number of evicted entries.
pub fn sweep(store: &WindowStore, now: DateTime<Utc>, max_age: Duration) -> usize {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::max_value());
    store.retain(|_, entry| entry.idle_for(now) <= max_age)
}

/// Spawns the background sweep task.
pub struct Reaper;

impl Reaper {
    /// Start sweeping `store` on the current tokio runtime.
    ///
    /// The first sweep happens one `interval` after spawning.
    pub fn spawn(store: Arc<WindowStore>, clock: Arc<dyn Clock>, config: ReaperConfig) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = config.interval.max(Duration::from_millis(1));

        info!(
            interval_secs = period.as_secs(),
            max_age_secs = config.max_age.as_secs(),
            "Starting rate limit reaper"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Rate limit reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = sweep(&store, clock.now(), config.max_age);
                        if evicted > 0 {
                            debug!(
                                evicted = evicted,
                                tracked = store.len(),
                                "Evicted idle rate limit entries"
                            );
                        }
                    }
                }
            }
        });

        ReaperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Owner of a running reaper.
///
/// Call [`ReaperHandle::shutdown`] to stop it and wait for the task to end.
/// Dropping the handle aborts the task.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the reaper and wait until its task has finished.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Rate limit reaper task failed");
                }
            }
        }
        info!("Rate limit reaper stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
