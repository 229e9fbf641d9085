//! Owned periodic background tasks.
//!
//! Sweepers are spawned by the component that owns the swept state and
//! stopped through that component at shutdown. Stopping is idempotent.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A task that runs `tick` every `period` until stopped or dropped.
pub struct PeriodicTask {
    name: &'static str,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawn the task on the current runtime. The first tick happens one
    /// full period after spawning.
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => {
                        tracing::debug!(task = name, "Periodic task shutting down");
                        break;
                    }
                    _ = interval.tick() => tick(),
                }
            }
        });

        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

        Self {
            name,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the task and wait for it to exit. Later calls return at once.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(task = self.name, error = %e, "Periodic task panicked");
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.stop().await;
        task.stop().await;
        assert!(!task.is_running());

        let before = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), before);
    }
}
