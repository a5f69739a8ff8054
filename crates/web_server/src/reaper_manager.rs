use std::sync::Arc;

use booking_coordinator::{HoldReaper, ReaperStats};
use tokio::task::JoinHandle;
use tracing::info;

/// Owns the background task that runs the hold reaper
pub struct ReaperManager {
    reaper: Arc<HoldReaper>,
    handle: Option<JoinHandle<()>>,
}

impl ReaperManager {
    /// Create a manager for `reaper`. Nothing runs until [`ReaperManager::start`].
    pub fn new(reaper: Arc<HoldReaper>) -> Self {
        Self {
            reaper,
            handle: None,
        }
    }

    /// Start the reaper loop. Calling it again while running is a no-op.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        info!("Starting hold reaper");

        let reaper = self.reaper.clone();
        self.handle = Some(tokio::spawn(async move {
            reaper.start().await;
        }));
    }

    /// Stop the reaper loop and wait for the task to wind down
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
            info!("Hold reaper stopped");
        }
    }

    /// Whether the background task is alive
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Reaper counters
    pub async fn stats(&self) -> ReaperStats {
        self.reaper.stats().await
    }
}

impl Drop for ReaperManager {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
